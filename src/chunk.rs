//! Block map (`mish`) chunk tables.
//!
//! Every partition listed in the property list carries one binary chunk
//! table: a fixed header followed by `num_block_chunks` packed 40-byte chunk
//! descriptors. Each descriptor maps a run of partition sectors to a region of
//! the data fork and names the encoding of that region.

use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::error::{Result, UdifError};
use crate::layout::{Constant, Field, Layout, LayoutError};
use crate::trailer::{Checksum, CHECKSUM_RECORD_SIZE};
use crate::SECTOR_SIZE;

/// Signature opening every chunk table.
pub const CHUNK_TABLE_MAGIC: &[u8; 4] = b"mish";
/// Size of the table header preceding the descriptors.
pub const CHUNK_TABLE_HEADER_SIZE: usize = 204;
/// Size of a single chunk descriptor.
pub const CHUNK_DESCRIPTOR_SIZE: usize = 40;

const TABLE_HEADER_LAYOUT: Layout = Layout {
    name: "mish header",
    size: CHUNK_TABLE_HEADER_SIZE,
    fields: &[
        Field::bytes("signature", 0, 4).expect(Constant::Bytes(CHUNK_TABLE_MAGIC)),
        Field::u32("version", 4),
        Field::u64("sector_number", 8),
        Field::u64("sector_count", 16),
        Field::u64("data_offset", 24),
        Field::u32("buffers_needed", 32),
        Field::u32("block_descriptors", 36),
        Field::bytes("checksum", 64, CHECKSUM_RECORD_SIZE),
        Field::u32("num_block_chunks", 200),
    ],
};

const DESCRIPTOR_LAYOUT: Layout = Layout {
    name: "mish chunk",
    size: CHUNK_DESCRIPTOR_SIZE,
    fields: &[
        Field::u32("entry_type", 0),
        Field::u32("comment", 4),
        Field::u64("sector_number", 8),
        Field::u64("sector_count", 16),
        Field::u64("compressed_offset", 24),
        Field::u64("compressed_length", 32),
    ],
};

/// Encoding of a chunk, as stored in its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Zero,
    Raw,
    Ignore,
    Comment,
    Adc,
    Zlib,
    Bzip2,
    Lzfse,
    Lzma,
    Terminator,
    /// A value the format does not define.
    Unknown(u32),
}

impl EntryType {
    pub fn from_u32(value: u32) -> EntryType {
        match value {
            0x0000_0000 => EntryType::Zero,
            0x0000_0001 => EntryType::Raw,
            0x0000_0002 => EntryType::Ignore,
            0x7fff_fffe => EntryType::Comment,
            0x8000_0004 => EntryType::Adc,
            0x8000_0005 => EntryType::Zlib,
            0x8000_0006 => EntryType::Bzip2,
            0x8000_0007 => EntryType::Lzfse,
            0x8000_0008 => EntryType::Lzma,
            0xffff_ffff => EntryType::Terminator,
            other => EntryType::Unknown(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            EntryType::Zero => 0x0000_0000,
            EntryType::Raw => 0x0000_0001,
            EntryType::Ignore => 0x0000_0002,
            EntryType::Comment => 0x7fff_fffe,
            EntryType::Adc => 0x8000_0004,
            EntryType::Zlib => 0x8000_0005,
            EntryType::Bzip2 => 0x8000_0006,
            EntryType::Lzfse => 0x8000_0007,
            EntryType::Lzma => 0x8000_0008,
            EntryType::Terminator => 0xffff_ffff,
            EntryType::Unknown(value) => *value,
        }
    }

    /// Whether descriptors of this type occupy sectors of the partition.
    ///
    /// Comments and the terminator carry no sector data and are excluded from
    /// coverage accounting.
    pub fn carries_sectors(&self) -> bool {
        !matches!(self, EntryType::Comment | EntryType::Terminator)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Zero => write!(f, "zero"),
            EntryType::Raw => write!(f, "raw"),
            EntryType::Ignore => write!(f, "ignore"),
            EntryType::Comment => write!(f, "comment"),
            EntryType::Adc => write!(f, "adc"),
            EntryType::Zlib => write!(f, "zlib"),
            EntryType::Bzip2 => write!(f, "bzip2"),
            EntryType::Lzfse => write!(f, "lzfse"),
            EntryType::Lzma => write!(f, "lzma"),
            EntryType::Terminator => write!(f, "terminator"),
            EntryType::Unknown(value) => write!(f, "unknown(0x{:08x})", value),
        }
    }
}

/// One run of sectors with its encoding and source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDescriptor {
    pub entry_type: EntryType,
    /// Comment / sector-flag word, not interpreted.
    pub comment: u32,
    /// First sector of the run, relative to the partition.
    pub sector_number: u64,
    pub sector_count: u64,
    /// Offset of the encoded bytes, relative to the data fork.
    pub compressed_offset: u64,
    pub compressed_length: u64,
}

impl ChunkDescriptor {
    /// Decoded size of the chunk in bytes.
    pub fn byte_len(&self) -> u64 {
        self.sector_count.saturating_mul(SECTOR_SIZE)
    }

    /// Sector range covered within the partition.
    pub fn sectors(&self) -> Range<u64> {
        self.sector_number..self.sector_number.saturating_add(self.sector_count)
    }
}

/// A parsed `mish` block: header fields plus the ordered chunk descriptors.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkTable {
    pub version: u32,
    /// First sector of this partition in the whole-disk coordinate space.
    pub sector_number: u64,
    pub sector_count: u64,
    /// Base added to every descriptor's `compressed_offset`.
    pub data_offset: u64,
    pub buffers_needed: u32,
    pub block_descriptors: u32,
    pub checksum: Checksum,
    pub chunks: Vec<ChunkDescriptor>,
}

impl ChunkTable {
    /// Parse a chunk table from the binary blob embedded in the metadata
    /// document. `partition` is only used to label errors.
    ///
    /// # Errors
    ///
    /// [`UdifError::MalformedChunkTable`] if the signature is wrong, if the blob
    /// is too short for its declared descriptors, or if the last descriptor is
    /// not a terminator.
    pub fn parse(data: &[u8], partition: usize) -> Result<ChunkTable> {
        let malformed = |reason: String| UdifError::MalformedChunkTable { partition, reason };
        let layout_error = |e: LayoutError| malformed(e.to_string());

        if data.len() < CHUNK_TABLE_MAGIC.len() || &data[..4] != CHUNK_TABLE_MAGIC {
            return Err(malformed(format!(
                "missing 'mish' signature (found {:02x?})",
                &data[..data.len().min(4)]
            )));
        }

        let header = TABLE_HEADER_LAYOUT.decode(data).map_err(layout_error)?;
        let num_block_chunks = header.u32("num_block_chunks").map_err(layout_error)? as usize;

        let needed = num_block_chunks
            .checked_mul(CHUNK_DESCRIPTOR_SIZE)
            .and_then(|n| n.checked_add(CHUNK_TABLE_HEADER_SIZE))
            .ok_or_else(|| malformed(format!("{} chunks overflow the table size", num_block_chunks)))?;
        if data.len() < needed {
            return Err(malformed(format!(
                "{} chunks need {} bytes, blob holds {}",
                num_block_chunks,
                needed,
                data.len()
            )));
        }

        let mut chunks = Vec::with_capacity(num_block_chunks);
        for index in 0..num_block_chunks {
            let start = CHUNK_TABLE_HEADER_SIZE + index * CHUNK_DESCRIPTOR_SIZE;
            let record = DESCRIPTOR_LAYOUT
                .decode(&data[start..start + CHUNK_DESCRIPTOR_SIZE])
                .map_err(layout_error)?;
            chunks.push(ChunkDescriptor {
                entry_type: EntryType::from_u32(record.u32("entry_type").map_err(layout_error)?),
                comment: record.u32("comment").map_err(layout_error)?,
                sector_number: record.u64("sector_number").map_err(layout_error)?,
                sector_count: record.u64("sector_count").map_err(layout_error)?,
                compressed_offset: record.u64("compressed_offset").map_err(layout_error)?,
                compressed_length: record.u64("compressed_length").map_err(layout_error)?,
            });
        }

        match chunks.last() {
            Some(last) if last.entry_type == EntryType::Terminator => {}
            _ => return Err(malformed("chunk list does not end with a terminator".into())),
        }

        Ok(ChunkTable {
            version: header.u32("version").map_err(layout_error)?,
            sector_number: header.u64("sector_number").map_err(layout_error)?,
            sector_count: header.u64("sector_count").map_err(layout_error)?,
            data_offset: header.u64("data_offset").map_err(layout_error)?,
            buffers_needed: header.u32("buffers_needed").map_err(layout_error)?,
            block_descriptors: header.u32("block_descriptors").map_err(layout_error)?,
            checksum: Checksum::from_bytes(header.bytes("checksum").map_err(layout_error)?),
            chunks,
        })
    }

    /// Decoded size of the partition in bytes.
    pub fn byte_len(&self) -> u64 {
        self.sector_count.saturating_mul(SECTOR_SIZE)
    }

    /// Descriptors up to (excluding) the first terminator that carry sectors,
    /// paired with their index in the table.
    pub fn data_chunks(&self) -> impl Iterator<Item = (usize, &ChunkDescriptor)> {
        self.chunks
            .iter()
            .enumerate()
            .take_while(|(_, chunk)| chunk.entry_type != EntryType::Terminator)
            .filter(|(_, chunk)| chunk.entry_type.carries_sectors())
    }

    /// Sector ranges of the partition that no descriptor covers.
    ///
    /// Assumes descriptors are sorted; overlapping ones are not reported.
    pub fn gaps(&self) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for (_, chunk) in self.data_chunks() {
            if chunk.sector_number > cursor {
                gaps.push(cursor..chunk.sector_number.min(self.sector_count));
            }
            cursor = cursor.max(chunk.sectors().end);
        }
        if cursor < self.sector_count {
            gaps.push(cursor..self.sector_count);
        }
        gaps.retain(|gap| !gap.is_empty());
        gaps
    }

    /// Whether the descriptors reconstruct exactly `[0, sector_count)`.
    pub fn is_fully_covered(&self) -> bool {
        let total = self
            .data_chunks()
            .try_fold(0u64, |total, (_, c)| total.checked_add(c.sector_count));
        total == Some(self.sector_count) && self.gaps().is_empty()
    }

    /// Total number of encoded bytes referenced by the table.
    pub fn compressed_len(&self) -> u64 {
        self.data_chunks()
            .filter(|(_, c)| !matches!(c.entry_type, EntryType::Zero | EntryType::Ignore))
            .fold(0u64, |total, (_, c)| total.saturating_add(c.compressed_length))
    }
}

/// Serialize a chunk table into its on-disk form.
///
/// Only used to build synthetic containers in tests.
#[cfg(test)]
pub(crate) fn encode_table(sector_number: u64, sector_count: u64, chunks: &[ChunkDescriptor]) -> Vec<u8> {
    let mut data = vec![0u8; CHUNK_TABLE_HEADER_SIZE];
    data[0..4].copy_from_slice(CHUNK_TABLE_MAGIC);
    data[4..8].copy_from_slice(&1u32.to_be_bytes());
    data[8..16].copy_from_slice(&sector_number.to_be_bytes());
    data[16..24].copy_from_slice(&sector_count.to_be_bytes());
    data[200..204].copy_from_slice(&(chunks.len() as u32).to_be_bytes());
    for chunk in chunks {
        data.extend_from_slice(&chunk.entry_type.as_u32().to_be_bytes());
        data.extend_from_slice(&chunk.comment.to_be_bytes());
        data.extend_from_slice(&chunk.sector_number.to_be_bytes());
        data.extend_from_slice(&chunk.sector_count.to_be_bytes());
        data.extend_from_slice(&chunk.compressed_offset.to_be_bytes());
        data.extend_from_slice(&chunk.compressed_length.to_be_bytes());
    }
    data
}

#[cfg(test)]
pub(crate) fn descriptor(entry_type: EntryType, sector_number: u64, sector_count: u64) -> ChunkDescriptor {
    ChunkDescriptor {
        entry_type,
        comment: 0,
        sector_number,
        sector_count,
        compressed_offset: 0,
        compressed_length: 0,
    }
}
