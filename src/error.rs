//! Error types shared by every stage of the UDIF reconstruction.
//!
//! Failures are split in two levels: [`ChunkError`] is what a single chunk
//! decode (or its placement) can produce, while [`UdifError`] locates a failure
//! inside the container (trailer, partition index, chunk index).

use std::io;
use thiserror::Error;

use crate::chunk::EntryType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UdifError>;

/// Failure of a single chunk descriptor.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// Decoded (or stored) length does not match `sector_count * 512`. An
    /// oversized zlib stream is not decoded past `expected + 1` bytes.
    #[error("chunk size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The chunk targets bytes outside of its partition, of the whole disk, or
    /// of the container.
    #[error("chunk out of bounds: {0}")]
    OutOfBounds(String),

    /// The chunk starts before the end of the previous one.
    #[error("chunk overlaps previous chunk: starts at sector {sector_number}, previous ends at {previous_end}")]
    Overlap { previous_end: u64, sector_number: u64 },

    /// The compressed stream could not be decoded.
    #[error("corrupt chunk: {0}")]
    Corrupt(String),

    /// A known compression scheme that this crate does not decode.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(EntryType),

    /// An entry type value the format does not define.
    #[error("unknown entry type 0x{0:08x}")]
    UnknownEntryType(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ChunkError {
    pub fn is_size_mismatch(&self) -> bool {
        matches!(self, ChunkError::SizeMismatch { .. })
    }

    /// Out of bounds or overlapping placement.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, ChunkError::OutOfBounds(_) | ChunkError::Overlap { .. })
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, ChunkError::Corrupt(_))
    }

    /// Unsupported or unknown entry type, the failures lenient mode skips.
    pub fn is_undecodable(&self) -> bool {
        matches!(
            self,
            ChunkError::UnsupportedCodec(_) | ChunkError::UnknownEntryType(_)
        )
    }
}

/// Failure of a reconstruction, located in the container.
#[derive(Error, Debug)]
pub enum UdifError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The trailer is missing or does not identify a UDIF container.
    #[error("malformed trailer: {0}")]
    MalformedTrailer(String),

    /// The metadata document could not be read.
    #[error("metadata document error: {0}")]
    Metadata(String),

    #[error("malformed chunk table in partition {partition}: {reason}")]
    MalformedChunkTable { partition: usize, reason: String },

    #[error("partition {partition}, chunk {chunk}: {source}")]
    Chunk {
        partition: usize,
        chunk: usize,
        #[source]
        source: ChunkError,
    },

    /// CRC32 of the reconstructed partition does not match its table.
    #[error("checksum mismatch in partition {partition}: expected 0x{expected:08x}, computed 0x{actual:08x}")]
    ChecksumMismatch {
        partition: usize,
        expected: u32,
        actual: u32,
    },
}

impl UdifError {
    /// Index of the partition this error is scoped to, if any.
    pub fn partition(&self) -> Option<usize> {
        match self {
            UdifError::MalformedChunkTable { partition, .. }
            | UdifError::Chunk { partition, .. }
            | UdifError::ChecksumMismatch { partition, .. } => Some(*partition),
            _ => None,
        }
    }

    /// Index of the chunk this error is scoped to, if any.
    pub fn chunk(&self) -> Option<usize> {
        match self {
            UdifError::Chunk { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }

    /// The underlying chunk failure, if any.
    pub fn chunk_error(&self) -> Option<&ChunkError> {
        match self {
            UdifError::Chunk { source, .. } => Some(source),
            _ => None,
        }
    }
}
