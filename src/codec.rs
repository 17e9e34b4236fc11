//! Chunk decoding.
//!
//! [`Codec`] maps every chunk entry type to what this crate does with it:
//! fill, copy, inflate, skip, or fail as unsupported. [`ChunkDecoder`] runs
//! that operation against the container and always yields exactly
//! `sector_count * 512` bytes, or a [`ChunkError`].

use std::fmt;
use std::sync::Arc;

use flate2::{Decompress, FlushDecompress, Status};
use log::trace;

use crate::chunk::{ChunkDescriptor, EntryType};
use crate::error::ChunkError;
use crate::source::ByteSource;

/// Decode operation bound to an entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// All-zero run, nothing is read from the container.
    Zero,
    /// Run whose content is not stored in the container (see [`IgnoreMode`]).
    Ignore,
    /// Stored bytes, copied verbatim.
    Raw,
    /// zlib-framed DEFLATE stream.
    Zlib,
    /// Comments and terminators: no sector data at all.
    Empty,
    /// Recognised compression scheme without a decoder in this crate.
    Unsupported(EntryType),
    /// Entry type value not defined by the format.
    Unknown(u32),
}

impl From<EntryType> for Codec {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Zero => Codec::Zero,
            EntryType::Ignore => Codec::Ignore,
            EntryType::Raw => Codec::Raw,
            EntryType::Zlib => Codec::Zlib,
            EntryType::Comment | EntryType::Terminator => Codec::Empty,
            EntryType::Adc | EntryType::Bzip2 | EntryType::Lzfse | EntryType::Lzma => {
                Codec::Unsupported(entry_type)
            }
            EntryType::Unknown(value) => Codec::Unknown(value),
        }
    }
}

/// What to produce for `ignore` chunks.
#[derive(Clone, Default)]
pub enum IgnoreMode {
    /// Zero-fill the run.
    #[default]
    Zero,
    /// Copy the same absolute byte range from an external reference image.
    Reference(Arc<dyn ByteSource>),
}

impl fmt::Debug for IgnoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreMode::Zero => write!(f, "Zero"),
            IgnoreMode::Reference(source) => write!(f, "Reference({} bytes)", source.size()),
        }
    }
}

/// Decodes chunks of one partition against the container content.
pub struct ChunkDecoder<'a> {
    source: &'a dyn ByteSource,
    /// Container offset the descriptors' `compressed_offset` is relative to.
    data_base: u64,
    ignore: &'a IgnoreMode,
}

impl<'a> ChunkDecoder<'a> {
    pub fn new(source: &'a dyn ByteSource, data_base: u64, ignore: &'a IgnoreMode) -> Self {
        ChunkDecoder {
            source,
            data_base,
            ignore,
        }
    }

    /// Decode `chunk` into a freshly allocated buffer.
    ///
    /// `disk_offset` is the absolute byte offset of the chunk in the
    /// whole-disk image; it is only used by [`IgnoreMode::Reference`].
    pub fn decode(&self, chunk: &ChunkDescriptor, disk_offset: u64) -> Result<Vec<u8>, ChunkError> {
        let len = match Codec::from(chunk.entry_type) {
            Codec::Empty => 0,
            _ => expected_len(chunk)?,
        };
        let mut out = vec![0u8; len];
        self.decode_into(chunk, disk_offset, &mut out)?;
        Ok(out)
    }

    /// Decode `chunk` straight into `out`, which must be exactly the decoded
    /// size of the chunk (empty for comments and terminators).
    ///
    /// On error the content of `out` is unspecified.
    pub fn decode_into(
        &self,
        chunk: &ChunkDescriptor,
        disk_offset: u64,
        out: &mut [u8],
    ) -> Result<(), ChunkError> {
        let codec = Codec::from(chunk.entry_type);
        trace!(
            "Decoding {} chunk: sectors {:?}, 0x{:x}+0x{:x}",
            chunk.entry_type,
            chunk.sectors(),
            chunk.compressed_offset,
            chunk.compressed_length
        );

        let expected = match codec {
            Codec::Empty => 0,
            _ => expected_len(chunk)?,
        };
        if out.len() != expected {
            return Err(ChunkError::OutOfBounds(format!(
                "output slice is {} bytes, chunk decodes to {}",
                out.len(),
                expected
            )));
        }

        match codec {
            Codec::Empty => Ok(()),
            Codec::Zero => {
                out.fill(0);
                Ok(())
            }
            Codec::Ignore => match self.ignore {
                IgnoreMode::Zero => {
                    out.fill(0);
                    Ok(())
                }
                IgnoreMode::Reference(reference) => {
                    let end = disk_offset.checked_add(expected as u64);
                    if end.map_or(true, |end| end > reference.size()) {
                        return Err(ChunkError::OutOfBounds(format!(
                            "reference image (0x{:x} bytes) does not cover 0x{:x}+0x{:x}",
                            reference.size(),
                            disk_offset,
                            expected
                        )));
                    }
                    out.copy_from_slice(&reference.read_at(disk_offset, expected)?);
                    Ok(())
                }
            },
            Codec::Raw => {
                if chunk.compressed_length != expected as u64 {
                    return Err(ChunkError::SizeMismatch {
                        expected: expected as u64,
                        actual: chunk.compressed_length,
                    });
                }
                let data = self.read_compressed(chunk)?;
                out.copy_from_slice(&data);
                Ok(())
            }
            Codec::Zlib => {
                let compressed = self.read_compressed(chunk)?;
                inflate_exact(&compressed, out)
            }
            Codec::Unsupported(entry_type) => Err(ChunkError::UnsupportedCodec(entry_type)),
            Codec::Unknown(value) => Err(ChunkError::UnknownEntryType(value)),
        }
    }

    /// Read the encoded bytes of `chunk`, checking they lie inside the
    /// container before touching it.
    fn read_compressed(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, ChunkError> {
        let start = self.data_base.checked_add(chunk.compressed_offset);
        let end = start.and_then(|s| s.checked_add(chunk.compressed_length));
        match (start, end) {
            (Some(start), Some(end))
                if end <= self.source.size() && chunk.compressed_length <= usize::MAX as u64 =>
            {
                Ok(self.source.read_at(start, chunk.compressed_length as usize)?)
            }
            _ => Err(ChunkError::OutOfBounds(format!(
                "encoded range 0x{:x}+0x{:x} (base 0x{:x}) exceeds container size (0x{:x})",
                chunk.compressed_offset,
                chunk.compressed_length,
                self.data_base,
                self.source.size()
            ))),
        }
    }
}

/// Decoded length of a sector-carrying chunk, in bytes.
fn expected_len(chunk: &ChunkDescriptor) -> Result<usize, ChunkError> {
    chunk
        .sector_count
        .checked_mul(crate::SECTOR_SIZE)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| {
            ChunkError::OutOfBounds(format!("{} sectors do not fit in memory", chunk.sector_count))
        })
}

/// Inflate a complete zlib stream into `out`, requiring the stream to end
/// exactly when `out` is full.
///
/// Inflation stops at the first byte past `out`, so an oversized stream is
/// reported with `actual` set to `out.len() + 1`.
fn inflate_exact(compressed: &[u8], out: &mut [u8]) -> Result<(), ChunkError> {
    let expected = out.len() as u64;
    let mut inflater = Decompress::new(true);
    // Only used to detect output past `out`.
    let mut spill = [0u8; 1];

    loop {
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let target: &mut [u8] = if produced < expected {
            &mut out[produced as usize..]
        } else {
            &mut spill[..]
        };

        let status = inflater
            .decompress(&compressed[consumed..], target, FlushDecompress::None)
            .map_err(|e| ChunkError::Corrupt(e.to_string()))?;

        let total = inflater.total_out();
        if total > expected {
            return Err(ChunkError::SizeMismatch {
                expected,
                actual: total,
            });
        }
        if status == Status::StreamEnd {
            if total != expected {
                return Err(ChunkError::SizeMismatch {
                    expected,
                    actual: total,
                });
            }
            return Ok(());
        }

        if inflater.total_in() as usize == consumed && total == produced {
            return Err(ChunkError::Corrupt(format!(
                "zlib stream truncated after {} decoded bytes",
                produced
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::descriptor;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn located(entry_type: EntryType, sectors: u64, offset: u64, len: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            compressed_offset: offset,
            compressed_length: len,
            ..descriptor(entry_type, 0, sectors)
        }
    }

    #[test]
    fn test_codec_mapping() {
        assert_eq!(Codec::from(EntryType::Zero), Codec::Zero);
        assert_eq!(Codec::from(EntryType::Terminator), Codec::Empty);
        assert_eq!(Codec::from(EntryType::Comment), Codec::Empty);
        assert_eq!(Codec::from(EntryType::Lzfse), Codec::Unsupported(EntryType::Lzfse));
        assert_eq!(Codec::from(EntryType::Unknown(9)), Codec::Unknown(9));
    }

    #[test]
    fn test_zero_and_ignore_fill() {
        // Garbage offsets must never be dereferenced for fill types.
        let container = vec![0xAAu8; 16];
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);

        for entry_type in [EntryType::Zero, EntryType::Ignore] {
            let chunk = located(entry_type, 3, u64::MAX - 1, u64::MAX);
            let data = decoder.decode(&chunk, 0).unwrap();
            assert_eq!(data.len(), 3 * 512);
            assert!(data.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_ignore_from_reference() {
        let container = vec![0u8; 16];
        let reference: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let ignore = IgnoreMode::Reference(Arc::new(reference.clone()));
        let decoder = ChunkDecoder::new(&container, 0, &ignore);

        let data = decoder.decode(&located(EntryType::Ignore, 2, 0, 0), 1024).unwrap();
        assert_eq!(data, reference[1024..2048]);

        assert!(matches!(
            decoder.decode(&located(EntryType::Ignore, 2, 0, 0), 3584),
            Err(ChunkError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_raw_copy() {
        let mut container = vec![0u8; 8];
        container.extend((0..512u32).map(|i| i as u8));
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);

        let data = decoder.decode(&located(EntryType::Raw, 1, 8, 512), 0).unwrap();
        assert_eq!(data, container[8..520]);
    }

    #[test]
    fn test_raw_size_mismatch() {
        let container = vec![0u8; 2048];
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);

        assert!(matches!(
            decoder.decode(&located(EntryType::Raw, 1, 0, 511), 0),
            Err(ChunkError::SizeMismatch {
                expected: 512,
                actual: 511
            })
        ));
    }

    #[test]
    fn test_raw_out_of_container() {
        let container = vec![0u8; 600];
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);
        assert!(matches!(
            decoder.decode(&located(EntryType::Raw, 1, 100, 512), 0),
            Err(ChunkError::OutOfBounds(_))
        ));

        let decoder = ChunkDecoder::new(&container, u64::MAX, &ignore);
        assert!(matches!(
            decoder.decode(&located(EntryType::Raw, 1, 1, 512), 0),
            Err(ChunkError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_data_base_is_applied() {
        let mut container = vec![0xFFu8; 32];
        container.extend(vec![0x11u8; 512]);
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 32, &ignore);
        let data = decoder.decode(&located(EntryType::Raw, 1, 0, 512), 0).unwrap();
        assert!(data.iter().all(|b| *b == 0x11));
    }

    #[test]
    fn test_zlib_roundtrip() {
        let payload = vec![b'A'; 512];
        let container = zlib(&payload);
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);

        let chunk = located(EntryType::Zlib, 1, 0, container.len() as u64);
        assert_eq!(decoder.decode(&chunk, 0).unwrap(), payload);
    }

    #[test]
    fn test_zlib_length_mismatch() {
        let ignore = IgnoreMode::Zero;

        let short = zlib(&[7u8; 500]);
        let decoder = ChunkDecoder::new(&short, 0, &ignore);
        assert!(matches!(
            decoder.decode(&located(EntryType::Zlib, 1, 0, short.len() as u64), 0),
            Err(ChunkError::SizeMismatch {
                expected: 512,
                actual: 500
            })
        ));

        let long = zlib(&[7u8; 1000]);
        let decoder = ChunkDecoder::new(&long, 0, &ignore);
        assert!(matches!(
            decoder.decode(&located(EntryType::Zlib, 1, 0, long.len() as u64), 0),
            Err(ChunkError::SizeMismatch {
                expected: 512,
                actual: 513
            })
        ));
    }

    #[test]
    fn test_zlib_oversized_stream_stops_early() {
        let bomb = zlib(&vec![0u8; 16 * 1024 * 1024]);
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&bomb, 0, &ignore);
        match decoder.decode(&located(EntryType::Zlib, 1, 0, bomb.len() as u64), 0) {
            Err(ChunkError::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, 512);
                assert_eq!(actual, 513);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_zlib_truncated_is_corrupt() {
        let stream = zlib(&(0..512u32).map(|i| (i * 7) as u8).collect::<Vec<_>>());
        let truncated = stream[..stream.len() / 2].to_vec();
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&truncated, 0, &ignore);
        assert!(matches!(
            decoder.decode(&located(EntryType::Zlib, 1, 0, truncated.len() as u64), 0),
            Err(ChunkError::Corrupt(_))
        ));
    }

    #[test]
    fn test_zlib_garbage_is_corrupt() {
        let garbage = vec![0x55u8; 64];
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&garbage, 0, &ignore);
        assert!(matches!(
            decoder.decode(&located(EntryType::Zlib, 1, 0, 64), 0),
            Err(ChunkError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unsupported_and_unknown() {
        let container = vec![0u8; 4096];
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);

        for entry_type in [EntryType::Adc, EntryType::Bzip2, EntryType::Lzfse, EntryType::Lzma] {
            match decoder.decode(&located(entry_type, 1, 0, 100), 0) {
                Err(ChunkError::UnsupportedCodec(found)) => assert_eq!(found, entry_type),
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert!(matches!(
            decoder.decode(&located(EntryType::Unknown(0x42), 1, 0, 100), 0),
            Err(ChunkError::UnknownEntryType(0x42))
        ));
    }

    #[test]
    fn test_empty_entries() {
        let container = vec![0u8; 16];
        let ignore = IgnoreMode::Zero;
        let decoder = ChunkDecoder::new(&container, 0, &ignore);
        assert!(decoder
            .decode(&located(EntryType::Comment, 5, 0, 0), 0)
            .unwrap()
            .is_empty());
        assert!(decoder
            .decode(&located(EntryType::Terminator, 0, 0, 0), 0)
            .unwrap()
            .is_empty());
    }
}
