//! UDIF trailer (`koly` block) parsing.
//!
//! The last 512 bytes of every UDIF container describe where the data fork
//! and the property list live, and how many sectors the reconstructed image
//! spans.
//!
//! Ref: <http://newosxbook.com/DMG.html>

use log::debug;
use serde::Serialize;

use crate::error::{Result, UdifError};
use crate::layout::{Constant, Field, Layout, LayoutError, Record};
use crate::source::ByteSource;
use crate::SECTOR_SIZE;

/// Size of the trailer record, also the value of its `header_size` field.
pub const TRAILER_SIZE: usize = 512;
/// Signature opening the trailer.
pub const TRAILER_MAGIC: &[u8; 4] = b"koly";

/// Checksum type value designating a CRC-32.
pub const CHECKSUM_TYPE_CRC32: u32 = 2;

/// Size in bytes of an on-disk checksum record (type, bit size, 32 words).
pub(crate) const CHECKSUM_RECORD_SIZE: usize = 136;

const TRAILER_LAYOUT: Layout = Layout {
    name: "koly trailer",
    size: TRAILER_SIZE,
    fields: &[
        Field::bytes("signature", 0, 4).expect(Constant::Bytes(TRAILER_MAGIC)),
        Field::u32("version", 4),
        Field::u32("header_size", 8).expect(Constant::U32(TRAILER_SIZE as u32)),
        Field::u32("flags", 12),
        Field::u64("running_data_fork_offset", 16),
        Field::u64("data_fork_offset", 24),
        Field::u64("data_fork_length", 32),
        Field::u64("rsrc_fork_offset", 40),
        Field::u64("rsrc_fork_length", 48),
        Field::u32("segment_number", 56),
        Field::u32("segment_count", 60),
        Field::bytes("segment_id", 64, 16),
        Field::bytes("data_checksum", 80, CHECKSUM_RECORD_SIZE),
        Field::u64("plist_offset", 216),
        Field::u64("plist_length", 224),
        Field::u64("codesign_offset", 296),
        Field::u64("codesign_length", 304),
        Field::bytes("master_checksum", 352, CHECKSUM_RECORD_SIZE),
        Field::u32("image_variant", 488),
        Field::u64("sector_count", 492),
    ],
};

/// A checksum record as stored in the trailer and in every chunk table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checksum {
    /// Algorithm identifier (`2` for CRC-32).
    pub checksum_type: u32,
    /// Number of meaningful bits in `words`.
    pub bit_size: u32,
    pub words: Vec<u32>,
}

impl Checksum {
    /// Decode a 136-byte big-endian checksum record.
    pub(crate) fn from_bytes(raw: &[u8]) -> Checksum {
        let word = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Checksum {
            checksum_type: word(0),
            bit_size: word(4),
            words: (0..32).map(|i| word(8 + i * 4)).collect(),
        }
    }

    /// The CRC-32 value, if this record holds one.
    pub fn crc32(&self) -> Option<u32> {
        if self.checksum_type == CHECKSUM_TYPE_CRC32 {
            self.words.first().copied()
        } else {
            None
        }
    }
}

/// The parsed `koly` trailer. Read once per container, immutable thereafter.
#[derive(Debug, Clone, Serialize)]
pub struct UdifTrailer {
    pub version: u32,
    pub header_size: u32,
    pub flags: u32,
    pub running_data_fork_offset: u64,
    pub data_fork_offset: u64,
    pub data_fork_length: u64,
    pub rsrc_fork_offset: u64,
    pub rsrc_fork_length: u64,
    pub segment_number: u32,
    pub segment_count: u32,
    pub segment_id: [u8; 16],
    pub data_checksum: Checksum,
    /// Byte offset of the XML property list in the container.
    pub plist_offset: u64,
    /// Byte length of the XML property list.
    pub plist_length: u64,
    pub codesign_offset: u64,
    pub codesign_length: u64,
    pub master_checksum: Checksum,
    pub image_variant: u32,
    /// Number of 512-byte sectors in the reconstructed whole-disk image.
    pub sector_count: u64,
}

fn malformed(e: LayoutError) -> UdifError {
    UdifError::MalformedTrailer(e.to_string())
}

impl UdifTrailer {
    /// Parse and validate a trailer from exactly (at least) 512 bytes.
    pub fn parse(data: &[u8]) -> Result<UdifTrailer> {
        let record: Record = TRAILER_LAYOUT.decode(data).map_err(malformed)?;
        let u32_field = |name| record.u32(name).map_err(malformed);
        let u64_field = |name| record.u64(name).map_err(malformed);
        let bytes_field = |name| record.bytes(name).map_err(malformed);

        let mut segment_id = [0u8; 16];
        segment_id.copy_from_slice(bytes_field("segment_id")?);

        Ok(UdifTrailer {
            version: u32_field("version")?,
            header_size: u32_field("header_size")?,
            flags: u32_field("flags")?,
            running_data_fork_offset: u64_field("running_data_fork_offset")?,
            data_fork_offset: u64_field("data_fork_offset")?,
            data_fork_length: u64_field("data_fork_length")?,
            rsrc_fork_offset: u64_field("rsrc_fork_offset")?,
            rsrc_fork_length: u64_field("rsrc_fork_length")?,
            segment_number: u32_field("segment_number")?,
            segment_count: u32_field("segment_count")?,
            segment_id,
            data_checksum: Checksum::from_bytes(bytes_field("data_checksum")?),
            plist_offset: u64_field("plist_offset")?,
            plist_length: u64_field("plist_length")?,
            codesign_offset: u64_field("codesign_offset")?,
            codesign_length: u64_field("codesign_length")?,
            master_checksum: Checksum::from_bytes(bytes_field("master_checksum")?),
            image_variant: u32_field("image_variant")?,
            sector_count: u64_field("sector_count")?,
        })
    }

    /// Read the final 512 bytes of `source` and parse them as a trailer.
    ///
    /// # Errors
    ///
    /// [`UdifError::MalformedTrailer`] if the source is shorter than a trailer
    /// or if the signature / header size constants do not match.
    pub fn read_from(source: &dyn ByteSource) -> Result<UdifTrailer> {
        let size = source.size();
        if size < TRAILER_SIZE as u64 {
            return Err(UdifError::MalformedTrailer(format!(
                "container is {} bytes, smaller than a {}-byte trailer",
                size, TRAILER_SIZE
            )));
        }
        let offset = size - TRAILER_SIZE as u64;
        debug!("Reading koly trailer at offset 0x{:x}", offset);
        let data = source.read_at(offset, TRAILER_SIZE)?;
        UdifTrailer::parse(&data)
    }

    /// Exact byte length of the reconstructed whole-disk image.
    pub fn image_size(&self) -> u64 {
        self.sector_count.saturating_mul(SECTOR_SIZE)
    }

    /// Read the raw bytes of the embedded property list.
    ///
    /// # Errors
    ///
    /// [`UdifError::MalformedTrailer`] if the declared range lies outside the
    /// container.
    pub fn read_plist(&self, source: &dyn ByteSource) -> Result<Vec<u8>> {
        let in_bounds = self
            .plist_offset
            .checked_add(self.plist_length)
            .map_or(false, |end| end <= source.size());
        if !in_bounds || self.plist_length > usize::MAX as u64 {
            return Err(UdifError::MalformedTrailer(format!(
                "property list range 0x{:x}+0x{:x} exceeds container size (0x{:x})",
                self.plist_offset,
                self.plist_length,
                source.size()
            )));
        }
        Ok(source.read_at(self.plist_offset, self.plist_length as usize)?)
    }
}

/// Serialize a trailer into its 512-byte on-disk form.
///
/// Only used to build synthetic containers in tests.
#[cfg(test)]
pub(crate) fn encode_trailer(plist_offset: u64, plist_length: u64, sector_count: u64) -> Vec<u8> {
    let mut data = vec![0u8; TRAILER_SIZE];
    data[0..4].copy_from_slice(TRAILER_MAGIC);
    data[4..8].copy_from_slice(&4u32.to_be_bytes());
    data[8..12].copy_from_slice(&(TRAILER_SIZE as u32).to_be_bytes());
    data[12..16].copy_from_slice(&1u32.to_be_bytes());
    data[216..224].copy_from_slice(&plist_offset.to_be_bytes());
    data[224..232].copy_from_slice(&plist_length.to_be_bytes());
    data[352..356].copy_from_slice(&CHECKSUM_TYPE_CRC32.to_be_bytes());
    data[356..360].copy_from_slice(&32u32.to_be_bytes());
    data[360..364].copy_from_slice(&0xcafe_babeu32.to_be_bytes());
    data[488..492].copy_from_slice(&1u32.to_be_bytes());
    data[492..500].copy_from_slice(&sector_count.to_be_bytes());
    data
}
