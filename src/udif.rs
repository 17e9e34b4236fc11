//! UDIF container abstraction
//!
//! [`UDIF`] opens an Apple disk image (`.dmg`), reconstructs it in memory and
//! exposes the whole-disk image through [`std::io::Read`] and
//! [`std::io::Seek`], like any other body of data.
//!

use std::{
    fs,
    io::{self, Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::assembler::{ImageAssembler, ReconstructOptions, ReconstructedImage};
use crate::chunk::ChunkTable;
use crate::error::Result;
use crate::metadata::{MetadataReader, PartitionBlob, PlistReader};
use crate::source::{ByteSource, FileSource};
use crate::trailer::UdifTrailer;
use crate::SECTOR_SIZE;

/// A reconstructed UDIF container.
pub struct UDIF {
    trailer: UdifTrailer,
    blobs: Vec<PartitionBlob>,
    image: ReconstructedImage,
    /// Cursor in the whole-disk image.
    position: u64,
}

/// JSON-friendly view of a container and its reconstruction.
#[derive(Debug, Serialize)]
pub struct UdifSummary<'a> {
    pub trailer: &'a UdifTrailer,
    pub image_size: u64,
    pub partitions: Vec<PartitionSummary<'a>>,
    pub failures: Vec<FailureSummary<'a>>,
}

#[derive(Debug, Serialize)]
pub struct PartitionSummary<'a> {
    pub index: usize,
    pub name: Option<&'a str>,
    pub id: Option<i64>,
    pub table: &'a ChunkTable,
    /// Sector ranges no chunk covers.
    pub gaps: Vec<Range<u64>>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary<'a> {
    pub index: usize,
    pub name: Option<&'a str>,
    pub error: String,
}

impl UDIF {
    /// Opens the container at `file_path` and reconstructs it with the default
    /// options.
    pub fn new(file_path: &str) -> Result<UDIF> {
        UDIF::open_with(file_path, &ReconstructOptions::default())
    }

    /// Opens the container at `file_path` and reconstructs it with `options`.
    pub fn open_with<P: AsRef<Path>>(file_path: P, options: &ReconstructOptions) -> Result<UDIF> {
        debug!("Opening UDIF container: {}", file_path.as_ref().display());
        let source = FileSource::new(file_path)?;
        UDIF::from_source(&source, options)
    }

    /// Reconstructs the container held by `source`, reading its metadata
    /// with the default [`PlistReader`].
    pub fn from_source(source: &dyn ByteSource, options: &ReconstructOptions) -> Result<UDIF> {
        UDIF::from_source_with_reader(source, &PlistReader, options)
    }

    /// Same as [`UDIF::from_source`] with a caller supplied metadata reader.
    pub fn from_source_with_reader(
        source: &dyn ByteSource,
        reader: &dyn MetadataReader,
        options: &ReconstructOptions,
    ) -> Result<UDIF> {
        let trailer = UdifTrailer::read_from(source)?;
        debug!(
            "koly trailer: version {}, {} sectors, plist at 0x{:x}+0x{:x}",
            trailer.version, trailer.sector_count, trailer.plist_offset, trailer.plist_length
        );
        if trailer.segment_count > 1 {
            warn!(
                "Segment {} of {}: only this segment's data is reconstructed",
                trailer.segment_number, trailer.segment_count
            );
        }

        let document = trailer.read_plist(source)?;
        let blobs = reader.partition_blobs(&document)?;
        let image = ImageAssembler::new(source, &trailer, options).reconstruct(&blobs)?;

        Ok(UDIF {
            trailer,
            blobs,
            image,
            position: 0,
        })
    }

    pub fn trailer(&self) -> &UdifTrailer {
        &self.trailer
    }

    /// Partition blobs as listed in the metadata document.
    pub fn blobs(&self) -> &[PartitionBlob] {
        &self.blobs
    }

    pub fn image(&self) -> &ReconstructedImage {
        &self.image
    }

    /// Size in bytes of the whole-disk image.
    pub fn size(&self) -> u64 {
        self.image.whole_disk().len() as u64
    }

    pub fn get_sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    pub fn print_info(&self) {
        info!("UDIF Disk Information:");
        info!("  Version: {}", self.trailer.version);
        info!("  Image variant: {}", self.trailer.image_variant);
        info!(
            "  Disk size: {} sectors ({} bytes)",
            self.trailer.sector_count,
            self.size()
        );
        info!(
            "  Data fork: 0x{:x}+0x{:x}",
            self.trailer.data_fork_offset, self.trailer.data_fork_length
        );
        if let Some(crc) = self.trailer.master_checksum.crc32() {
            info!("  Master checksum (CRC32): 0x{:08x}", crc);
        }
        info!("  Partitions:");
        for partition in self.image.partitions() {
            info!(
                "    - [{}] {}: start sector {}, {} sectors, {} chunks",
                partition.index,
                partition.name.as_deref().unwrap_or("<unnamed>"),
                partition.table.sector_number,
                partition.table.sector_count,
                partition.table.chunks.len()
            );
        }
        for failure in self.image.failures() {
            info!(
                "    - [{}] {}: FAILED ({})",
                failure.index,
                failure.name.as_deref().unwrap_or("<unnamed>"),
                failure.error
            );
        }
    }

    pub fn summary(&self) -> UdifSummary<'_> {
        UdifSummary {
            trailer: &self.trailer,
            image_size: self.size(),
            partitions: self
                .image
                .partitions()
                .iter()
                .map(|p| PartitionSummary {
                    index: p.index,
                    name: p.name.as_deref(),
                    id: p.id,
                    table: &p.table,
                    gaps: p.table.gaps(),
                })
                .collect(),
            failures: self
                .image
                .failures()
                .iter()
                .map(|f| FailureSummary {
                    index: f.index,
                    name: f.name.as_deref(),
                    error: f.error.to_string(),
                })
                .collect(),
        }
    }

    /// Writes `dump-<index>.img` for every reconstructed partition and
    /// `dump-whole.img` into `dir`, creating it if needed. Returns the written
    /// paths.
    pub fn dump<P: AsRef<Path>>(&self, dir: P) -> io::Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for partition in self.image.partitions() {
            let path = dir.join(format!("dump-{}.img", partition.index));
            fs::write(&path, partition.data())?;
            debug!("Wrote {} ({} bytes)", path.display(), partition.data().len());
            written.push(path);
        }
        let path = dir.join("dump-whole.img");
        fs::write(&path, self.image.whole_disk())?;
        info!("Wrote {} ({} bytes)", path.display(), self.size());
        written.push(path);
        Ok(written)
    }

    /// Reads from the whole-disk image at the current position. Returns 0 at
    /// the end of the image.
    pub fn udif_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let disk = self.image.whole_disk();
        let start = self.position.min(disk.len() as u64) as usize;
        let count = buf.len().min(disk.len() - start);
        buf[..count].copy_from_slice(&disk[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }

    /// Moves the cursor. Positions past the end of the image are rejected.
    pub fn udif_seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size();
        let new_position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            SeekFrom::End(offset) => size.checked_add_signed(offset),
        };
        match new_position {
            Some(position) if position <= size => {
                self.position = position;
                Ok(position)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset is out of bounds",
            )),
        }
    }
}

impl Read for UDIF {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.udif_read(buf)
    }
}

impl Seek for UDIF {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.udif_seek(pos)
    }
}
