//! Reconstruction of raw disk images from UDIF (Apple `.dmg`) containers.
//!
//! A container ends with a 512-byte `koly` trailer pointing at an XML property
//! list. The property list carries one binary `mish` chunk table per
//! partition, and every chunk says how a run of sectors is stored in the data
//! fork (zero-filled, raw, zlib, ...). [`UDIF`] ties the stages together:
//!
//! ```no_run
//! use std::io::Read;
//! use exhume_udif::UDIF;
//!
//! let mut udif = UDIF::new("image.dmg").unwrap();
//! udif.print_info();
//! let mut mbr = [0u8; 512];
//! udif.read_exact(&mut mbr).unwrap();
//! ```

pub mod assembler;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod source;
pub mod trailer;
pub mod udif;

/// Every UDIF sector is 512 bytes.
pub const SECTOR_SIZE: u64 = 512;

pub use assembler::{ImageAssembler, ReconstructOptions, ReconstructedImage};
pub use chunk::{ChunkDescriptor, ChunkTable, EntryType};
pub use codec::{ChunkDecoder, IgnoreMode};
pub use error::{ChunkError, Result, UdifError};
pub use metadata::{MetadataReader, PartitionBlob, PlistReader};
pub use source::{ByteSource, FileSource};
pub use trailer::UdifTrailer;
pub use udif::UDIF;
