//! Reconstruction of the partition and whole-disk buffers.
//!
//! Every partition is handled independently: its chunk table is parsed, every
//! chunk is placed (partition-relative and absolute byte ranges computed and
//! bounds-checked) before anything is written, then chunks are decoded into
//! disjoint slices of the partition buffer. Successful partitions are finally
//! copied, chunk by chunk, into the whole-disk buffer. Bytes no chunk targets
//! keep their pre-fill sentinel so that gaps stay visible.

use std::ops::Range;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use regex::Regex;

use crate::chunk::{ChunkDescriptor, ChunkTable};
use crate::codec::{ChunkDecoder, IgnoreMode};
use crate::error::{ChunkError, Result, UdifError};
use crate::metadata::PartitionBlob;
use crate::source::ByteSource;
use crate::trailer::UdifTrailer;
use crate::SECTOR_SIZE;

/// Default pre-fill of the whole-disk buffer.
pub const DEFAULT_FILL_BYTE: u8 = b'Z';
/// Default pre-fill of every partition buffer.
pub const DEFAULT_PARTITION_FILL_BYTE: u8 = b'U';

/// Knobs of a reconstruction.
#[derive(Debug, Clone)]
pub struct ReconstructOptions {
    /// Sentinel for whole-disk bytes no chunk writes.
    pub fill_byte: u8,
    /// Sentinel for partition bytes no chunk writes.
    pub partition_fill_byte: u8,
    /// Leave unsupported / unknown chunks at the sentinel instead of failing
    /// the partition.
    pub lenient_codecs: bool,
    /// Content produced for `ignore` chunks.
    pub ignore_mode: IgnoreMode,
    /// Compare the CRC-32 stored in each chunk table with the rebuilt
    /// partition.
    pub verify_checksums: bool,
    /// Decode partitions and chunks on the rayon thread pool.
    pub parallel: bool,
    /// Only reconstruct partitions whose name matches. Unnamed partitions
    /// never match.
    pub partition_filter: Option<Regex>,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        ReconstructOptions {
            fill_byte: DEFAULT_FILL_BYTE,
            partition_fill_byte: DEFAULT_PARTITION_FILL_BYTE,
            lenient_codecs: false,
            ignore_mode: IgnoreMode::Zero,
            verify_checksums: false,
            parallel: true,
            partition_filter: None,
        }
    }
}

/// Where a chunk lands, in both coordinate systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Index of the descriptor in its table.
    pub chunk: usize,
    /// Byte range in the partition buffer.
    pub local: Range<usize>,
    /// Byte offset in the whole-disk buffer.
    pub disk_offset: u64,
}

impl Placement {
    fn disk_range(&self) -> Range<usize> {
        let start = self.disk_offset as usize;
        start..start + self.local.len()
    }
}

/// One reconstructed partition.
#[derive(Debug)]
pub struct PartitionImage {
    /// Position of the partition in the metadata document.
    pub index: usize,
    pub name: Option<String>,
    pub id: Option<i64>,
    pub table: ChunkTable,
    data: Vec<u8>,
    /// Chunks whose decoded bytes are in `data`.
    written: Vec<Placement>,
}

impl PartitionImage {
    /// The partition content, `table.sector_count * 512` bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Byte offset of the partition in the whole-disk image.
    pub fn disk_offset(&self) -> u64 {
        self.table.sector_number.saturating_mul(SECTOR_SIZE)
    }

    /// Byte range of the partition in the whole-disk image.
    pub fn disk_range(&self) -> Range<u64> {
        let start = self.disk_offset();
        start..start.saturating_add(self.data.len() as u64)
    }

    /// Placements of the chunks that were decoded.
    pub fn written(&self) -> &[Placement] {
        &self.written
    }
}

/// A partition that could not be reconstructed.
#[derive(Debug)]
pub struct PartitionFailure {
    pub index: usize,
    pub name: Option<String>,
    pub error: UdifError,
}

/// Output of a reconstruction: the whole-disk image, every partition that
/// succeeded, and a report for those that did not.
#[derive(Debug)]
pub struct ReconstructedImage {
    whole_disk: Vec<u8>,
    partitions: Vec<PartitionImage>,
    failures: Vec<PartitionFailure>,
}

impl ReconstructedImage {
    pub fn whole_disk(&self) -> &[u8] {
        &self.whole_disk
    }

    pub fn into_whole_disk(self) -> Vec<u8> {
        self.whole_disk
    }

    pub fn partitions(&self) -> &[PartitionImage] {
        &self.partitions
    }

    pub fn failures(&self) -> &[PartitionFailure] {
        &self.failures
    }

    /// Whether every partition was reconstructed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives the reconstruction of one container.
pub struct ImageAssembler<'a> {
    source: &'a dyn ByteSource,
    trailer: &'a UdifTrailer,
    options: &'a ReconstructOptions,
}

impl<'a> ImageAssembler<'a> {
    pub fn new(
        source: &'a dyn ByteSource,
        trailer: &'a UdifTrailer,
        options: &'a ReconstructOptions,
    ) -> Self {
        ImageAssembler {
            source,
            trailer,
            options,
        }
    }

    /// Rebuild the whole-disk image from the ordered partition blobs.
    ///
    /// A failing partition does not stop its siblings; it is reported in
    /// [`ReconstructedImage::failures`].
    ///
    /// # Errors
    ///
    /// Only if the whole-disk buffer itself cannot be allocated.
    pub fn reconstruct(&self, blobs: &[PartitionBlob]) -> Result<ReconstructedImage> {
        let too_large = || {
            UdifError::MalformedTrailer(format!(
                "{} sectors do not fit in memory",
                self.trailer.sector_count
            ))
        };
        let whole_len = usize::try_from(self.trailer.image_size())
            .ok()
            .filter(|_| self.trailer.sector_count.checked_mul(SECTOR_SIZE).is_some())
            .ok_or_else(too_large)?;
        let mut whole_disk =
            filled_buffer(whole_len, self.options.fill_byte).ok_or_else(too_large)?;
        info!(
            "Reconstructing {} partition(s) into a {} byte image",
            blobs.len(),
            whole_len
        );

        let selected: Vec<(usize, &PartitionBlob)> = blobs
            .iter()
            .enumerate()
            .filter(|(index, blob)| {
                let keep = self.is_selected(blob);
                if !keep {
                    debug!(
                        "Skipping partition {} ({})",
                        index,
                        blob.name.as_deref().unwrap_or("<unnamed>")
                    );
                }
                keep
            })
            .collect();

        let assemble = |&(index, blob): &(usize, &PartitionBlob)| {
            self.assemble_partition(index, blob, whole_len as u64)
        };
        let results: Vec<Result<PartitionImage>> = if self.options.parallel {
            selected.par_iter().map(assemble).collect()
        } else {
            selected.iter().map(assemble).collect()
        };

        let mut partitions: Vec<PartitionImage> = Vec::new();
        let mut failures = Vec::new();
        for (result, (index, blob)) in results.into_iter().zip(selected) {
            match result {
                Ok(partition) => {
                    let range = partition.disk_range();
                    for earlier in &partitions {
                        let other = earlier.disk_range();
                        if range.start < other.end && other.start < range.end {
                            warn!(
                                "Partition {} (bytes 0x{:x}..0x{:x}) overlaps partition {}, overwriting it",
                                index, range.start, range.end, earlier.index
                            );
                        }
                    }
                    for placement in &partition.written {
                        whole_disk[placement.disk_range()]
                            .copy_from_slice(&partition.data[placement.local.clone()]);
                    }
                    partitions.push(partition);
                }
                Err(err) => {
                    error!("Partition {} failed: {}", index, err);
                    failures.push(PartitionFailure {
                        index,
                        name: blob.name.clone(),
                        error: err,
                    });
                }
            }
        }

        Ok(ReconstructedImage {
            whole_disk,
            partitions,
            failures,
        })
    }

    fn is_selected(&self, blob: &PartitionBlob) -> bool {
        match (&self.options.partition_filter, &blob.name) {
            (None, _) => true,
            (Some(filter), Some(name)) => filter.is_match(name),
            (Some(_), None) => false,
        }
    }

    /// Parse and decode a single partition. `whole_len` is the byte length of
    /// the whole-disk image, used to reject chunks that land outside of it.
    pub fn assemble_partition(
        &self,
        index: usize,
        blob: &PartitionBlob,
        whole_len: u64,
    ) -> Result<PartitionImage> {
        let table = ChunkTable::parse(&blob.data, index)?;
        let malformed = |reason: String| UdifError::MalformedChunkTable {
            partition: index,
            reason,
        };
        debug!(
            "Partition {} ({}): sectors {}+{}, {} chunk descriptor(s)",
            index,
            blob.name.as_deref().unwrap_or("<unnamed>"),
            table.sector_number,
            table.sector_count,
            table.chunks.len()
        );

        match table.sector_number.checked_add(table.sector_count) {
            Some(end) if end <= self.trailer.sector_count => {}
            _ => {
                return Err(malformed(format!(
                    "sectors {}+{} exceed the disk ({} sectors)",
                    table.sector_number, table.sector_count, self.trailer.sector_count
                )))
            }
        }

        let too_large = || malformed(format!("{} sectors do not fit in memory", table.sector_count));
        let part_len = usize::try_from(table.byte_len())
            .ok()
            .filter(|_| table.sector_count.checked_mul(SECTOR_SIZE).is_some())
            .ok_or_else(too_large)?;
        let data_base = self
            .trailer
            .data_fork_offset
            .checked_add(table.data_offset)
            .ok_or_else(|| malformed("data offset overflows".into()))?;

        let placements = plan_partition(&table, index, part_len, whole_len)?;
        for gap in table.gaps() {
            warn!(
                "Partition {}: sectors {}..{} are not covered by any chunk",
                index, gap.start, gap.end
            );
        }

        let mut data =
            filled_buffer(part_len, self.options.partition_fill_byte).ok_or_else(too_large)?;
        let decoder = ChunkDecoder::new(self.source, data_base, &self.options.ignore_mode);
        let written = self.decode_chunks(&decoder, &table, index, &placements, &mut data)?;

        if self.options.verify_checksums {
            match table.checksum.crc32() {
                Some(expected) => {
                    let actual = crc32fast::hash(&data);
                    if actual != expected {
                        return Err(UdifError::ChecksumMismatch {
                            partition: index,
                            expected,
                            actual,
                        });
                    }
                    debug!("Partition {}: CRC32 0x{:08x} verified", index, actual);
                }
                None => debug!(
                    "Partition {}: checksum type {} not verified",
                    index, table.checksum.checksum_type
                ),
            }
        }

        info!(
            "Partition {} reconstructed: {} bytes from {} chunk(s)",
            index,
            part_len,
            written.len()
        );
        Ok(PartitionImage {
            index,
            name: blob.name.clone(),
            id: blob.id,
            table,
            data,
            written,
        })
    }

    /// Decode every placed chunk into its own slice of `data`. Returns the
    /// placements that actually received decoded bytes.
    fn decode_chunks(
        &self,
        decoder: &ChunkDecoder<'_>,
        table: &ChunkTable,
        partition: usize,
        placements: &[Placement],
        data: &mut [u8],
    ) -> Result<Vec<Placement>> {
        let jobs = split_disjoint(data, placements);
        let decode = |(placement, slot): (&Placement, &mut [u8])| {
            let chunk = &table.chunks[placement.chunk];
            self.decode_one(decoder, chunk, placement, slot)
                .map_err(|source| UdifError::Chunk {
                    partition,
                    chunk: placement.chunk,
                    source,
                })
        };

        let outcomes: Vec<Result<bool>> = if self.options.parallel {
            jobs.into_par_iter().map(decode).collect()
        } else {
            jobs.into_iter().map(decode).collect()
        };

        let mut written = Vec::with_capacity(placements.len());
        for (placement, outcome) in placements.iter().zip(outcomes) {
            if outcome? {
                written.push(placement.clone());
            }
        }
        Ok(written)
    }

    /// Decode one chunk. `Ok(false)` means the chunk was skipped in lenient
    /// mode and `slot` holds the partition sentinel.
    fn decode_one(
        &self,
        decoder: &ChunkDecoder<'_>,
        chunk: &ChunkDescriptor,
        placement: &Placement,
        slot: &mut [u8],
    ) -> std::result::Result<bool, ChunkError> {
        match decoder.decode_into(chunk, placement.disk_offset, slot) {
            Ok(()) => Ok(true),
            Err(err) if err.is_undecodable() && self.options.lenient_codecs => {
                warn!(
                    "Chunk {} ({} sectors at {}) left unreconstructed: {}",
                    placement.chunk, chunk.sector_count, chunk.sector_number, err
                );
                slot.fill(self.options.partition_fill_byte);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

/// Compute and validate the placement of every data chunk of `table`.
///
/// Chunks must come in non-decreasing sector order without overlapping, and
/// must fit both the partition (`part_len` bytes) and the whole disk
/// (`whole_len` bytes). Nothing is written until this succeeds.
pub fn plan_partition(
    table: &ChunkTable,
    partition: usize,
    part_len: usize,
    whole_len: u64,
) -> Result<Vec<Placement>> {
    let chunk_error = |chunk: usize, source: ChunkError| UdifError::Chunk {
        partition,
        chunk,
        source,
    };
    let out_of_bounds = |chunk: usize, reason: String| chunk_error(chunk, ChunkError::OutOfBounds(reason));

    let partition_base = table.sector_number.checked_mul(SECTOR_SIZE);
    let mut placements = Vec::new();
    let mut previous_end = 0u64;

    for (index, chunk) in table.data_chunks() {
        if chunk.sector_number < previous_end {
            return Err(chunk_error(
                index,
                ChunkError::Overlap {
                    previous_end,
                    sector_number: chunk.sector_number,
                },
            ));
        }

        let local_off = chunk.sector_number.checked_mul(SECTOR_SIZE);
        let len = chunk.sector_count.checked_mul(SECTOR_SIZE);
        let local_end = local_off.zip(len).and_then(|(o, l)| o.checked_add(l));
        let (local_off, local_end) = match (local_off, local_end) {
            (Some(off), Some(end)) if end <= part_len as u64 => (off, end),
            _ => {
                return Err(out_of_bounds(
                    index,
                    format!(
                        "sectors {}+{} exceed the partition ({} sectors)",
                        chunk.sector_number, chunk.sector_count, table.sector_count
                    ),
                ))
            }
        };

        let disk_offset = partition_base.and_then(|base| base.checked_add(local_off));
        match disk_offset.and_then(|off| off.checked_add(local_end - local_off)) {
            Some(end) if end <= whole_len => {}
            _ => {
                return Err(out_of_bounds(
                    index,
                    format!(
                        "sectors {}+{} of partition starting at sector {} exceed the disk ({} bytes)",
                        chunk.sector_number, chunk.sector_count, table.sector_number, whole_len
                    ),
                ))
            }
        }

        previous_end = chunk.sector_number + chunk.sector_count;
        placements.push(Placement {
            chunk: index,
            local: local_off as usize..local_end as usize,
            // Checked just above.
            disk_offset: disk_offset.unwrap_or_default(),
        });
    }
    Ok(placements)
}

/// A `len` byte buffer set to `fill`, or `None` if it cannot be allocated.
fn filled_buffer(len: usize, fill: u8) -> Option<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).ok()?;
    buffer.resize(len, fill);
    Some(buffer)
}

/// Hand out one exclusive slice of `data` per placement.
///
/// Placements must be sorted and non-overlapping, as produced by
/// [`plan_partition`].
fn split_disjoint<'d, 'p>(
    data: &'d mut [u8],
    placements: &'p [Placement],
) -> Vec<(&'p Placement, &'d mut [u8])> {
    let mut jobs = Vec::with_capacity(placements.len());
    let mut rest = data;
    let mut consumed = 0usize;
    for placement in placements {
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(placement.local.start - consumed);
        let (slot, tail) = tail.split_at_mut(placement.local.len());
        rest = tail;
        consumed = placement.local.end;
        jobs.push((placement, slot));
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{descriptor, encode_table, EntryType};
    use crate::trailer::{encode_trailer, UdifTrailer};

    fn trailer(sector_count: u64) -> UdifTrailer {
        UdifTrailer::parse(&encode_trailer(0, 0, sector_count)).unwrap()
    }

    fn blob(sector_number: u64, sector_count: u64, chunks: &[ChunkDescriptor]) -> PartitionBlob {
        PartitionBlob {
            name: Some(format!("part@{}", sector_number)),
            id: None,
            data: encode_table(sector_number, sector_count, chunks),
        }
    }

    fn raw(sector_number: u64, sector_count: u64, offset: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            compressed_offset: offset,
            compressed_length: sector_count * SECTOR_SIZE,
            ..descriptor(EntryType::Raw, sector_number, sector_count)
        }
    }

    fn terminator() -> ChunkDescriptor {
        descriptor(EntryType::Terminator, 0, 0)
    }

    #[test]
    fn test_plan_coordinates() {
        let chunks = vec![
            descriptor(EntryType::Zero, 0, 2),
            descriptor(EntryType::Comment, 0, 0),
            raw(2, 1, 0),
            terminator(),
        ];
        let table = ChunkTable::parse(&encode_table(10, 4, &chunks), 0).unwrap();
        let plan = plan_partition(&table, 0, 2048, 14 * 512).unwrap();
        assert_eq!(
            plan,
            vec![
                Placement {
                    chunk: 0,
                    local: 0..1024,
                    disk_offset: 5120
                },
                Placement {
                    chunk: 2,
                    local: 1024..1536,
                    disk_offset: 6144
                },
            ]
        );
    }

    #[test]
    fn test_plan_rejects_overlap() {
        let chunks = vec![
            descriptor(EntryType::Zero, 0, 2),
            descriptor(EntryType::Zero, 1, 2),
            terminator(),
        ];
        let table = ChunkTable::parse(&encode_table(0, 4, &chunks), 0).unwrap();
        match plan_partition(&table, 2, 2048, 2048) {
            Err(UdifError::Chunk {
                partition: 2,
                chunk: 1,
                source: ChunkError::Overlap { previous_end: 2, sector_number: 1 },
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_plan_rejects_out_of_partition() {
        let chunks = vec![descriptor(EntryType::Zero, 3, 2), terminator()];
        let table = ChunkTable::parse(&encode_table(0, 4, &chunks), 0).unwrap();
        assert!(matches!(
            plan_partition(&table, 0, 2048, 1 << 20),
            Err(UdifError::Chunk {
                chunk: 0,
                source: ChunkError::OutOfBounds(_),
                ..
            })
        ));
    }

    #[test]
    fn test_plan_rejects_out_of_disk() {
        let chunks = vec![descriptor(EntryType::Zero, 0, 4), terminator()];
        let table = ChunkTable::parse(&encode_table(2, 4, &chunks), 0).unwrap();
        assert!(matches!(
            plan_partition(&table, 0, 2048, 4 * 512),
            Err(UdifError::Chunk {
                source: ChunkError::OutOfBounds(_),
                ..
            })
        ));
    }

    #[test]
    fn test_plan_stops_at_terminator() {
        let chunks = vec![
            descriptor(EntryType::Zero, 0, 1),
            terminator(),
            descriptor(EntryType::Zero, 100, 100),
            terminator(),
        ];
        let table = ChunkTable::parse(&encode_table(0, 1, &chunks), 0).unwrap();
        assert_eq!(plan_partition(&table, 0, 512, 512).unwrap().len(), 1);
    }

    #[test]
    fn test_split_disjoint() {
        let mut data = vec![0u8; 10];
        let placements = vec![
            Placement {
                chunk: 0,
                local: 1..3,
                disk_offset: 0,
            },
            Placement {
                chunk: 1,
                local: 3..3,
                disk_offset: 0,
            },
            Placement {
                chunk: 2,
                local: 6..10,
                disk_offset: 0,
            },
        ];
        for (placement, slot) in split_disjoint(&mut data, &placements) {
            assert_eq!(slot.len(), placement.local.len());
            slot.fill(placement.chunk as u8 + 1);
        }
        assert_eq!(data, vec![0, 1, 1, 0, 0, 0, 3, 3, 3, 3]);
    }

    #[test]
    fn test_two_partitions_and_failure_isolation() {
        let mut container = vec![0x11u8; 512];
        container.extend(vec![0x22u8; 512]);

        let good = blob(0, 2, &[raw(0, 1, 0), raw(1, 1, 512), terminator()]);
        let bad = blob(2, 1, &[raw(0, 1, 4096), terminator()]);
        let broken = PartitionBlob {
            name: None,
            id: None,
            data: b"nope".to_vec(),
        };

        let trailer = trailer(4);
        for parallel in [true, false] {
            let options = ReconstructOptions {
                parallel,
                ..Default::default()
            };
            let image = ImageAssembler::new(&container, &trailer, &options)
                .reconstruct(&[good.clone(), bad.clone(), broken.clone()])
                .unwrap();

            assert!(!image.is_complete());
            assert_eq!(image.partitions().len(), 1);
            assert_eq!(image.partitions()[0].index, 0);
            assert_eq!(image.partitions()[0].data().len(), 1024);

            let failures = image.failures();
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].index, 1);
            assert_eq!(failures[0].error.chunk(), Some(0));
            assert!(matches!(
                failures[0].error.chunk_error(),
                Some(ChunkError::OutOfBounds(_))
            ));
            assert_eq!(failures[1].index, 2);
            assert!(matches!(
                failures[1].error,
                UdifError::MalformedChunkTable { partition: 2, .. }
            ));

            let disk = image.whole_disk();
            assert_eq!(disk.len(), 2048);
            assert!(disk[..512].iter().all(|b| *b == 0x11));
            assert!(disk[512..1024].iter().all(|b| *b == 0x22));
            assert!(disk[1024..].iter().all(|b| *b == DEFAULT_FILL_BYTE));
        }
    }

    #[test]
    fn test_lenient_codecs() {
        let container = vec![0u8; 1024];
        let chunks = vec![
            descriptor(EntryType::Zero, 0, 1),
            ChunkDescriptor {
                compressed_length: 10,
                ..descriptor(EntryType::Lzfse, 1, 1)
            },
            descriptor(EntryType::Unknown(0x1234), 2, 1),
            terminator(),
        ];
        let trailer = trailer(3);
        let blobs = [blob(0, 3, &chunks)];

        let strict = ReconstructOptions::default();
        let image = ImageAssembler::new(&container, &trailer, &strict)
            .reconstruct(&blobs)
            .unwrap();
        assert!(matches!(
            image.failures()[0].error.chunk_error(),
            Some(ChunkError::UnsupportedCodec(EntryType::Lzfse))
        ));
        assert!(image.whole_disk().iter().all(|b| *b == DEFAULT_FILL_BYTE));

        let lenient = ReconstructOptions {
            lenient_codecs: true,
            ..Default::default()
        };
        let image = ImageAssembler::new(&container, &trailer, &lenient)
            .reconstruct(&blobs)
            .unwrap();
        assert!(image.is_complete());
        let partition = &image.partitions()[0];
        assert_eq!(partition.written().len(), 1);
        assert!(partition.data()[..512].iter().all(|b| *b == 0));
        assert!(partition.data()[512..]
            .iter()
            .all(|b| *b == DEFAULT_PARTITION_FILL_BYTE));
        assert!(image.whole_disk()[..512].iter().all(|b| *b == 0));
        assert!(image.whole_disk()[512..]
            .iter()
            .all(|b| *b == DEFAULT_FILL_BYTE));
    }

    #[test]
    fn test_partition_filter_keeps_indices() {
        let container = vec![0u8; 512];
        let blobs = [
            blob(0, 1, &[descriptor(EntryType::Zero, 0, 1), terminator()]),
            blob(1, 1, &[descriptor(EntryType::Zero, 0, 1), terminator()]),
        ];
        let trailer = trailer(2);
        let options = ReconstructOptions {
            partition_filter: Some(Regex::new("@1$").unwrap()),
            ..Default::default()
        };
        let image = ImageAssembler::new(&container, &trailer, &options)
            .reconstruct(&blobs)
            .unwrap();
        assert_eq!(image.partitions().len(), 1);
        assert_eq!(image.partitions()[0].index, 1);
        assert!(image.whole_disk()[..512]
            .iter()
            .all(|b| *b == DEFAULT_FILL_BYTE));
        assert!(image.whole_disk()[512..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_partition_past_disk_end_fails_alone() {
        let container = vec![0u8; 512];
        let good = blob(0, 1, &[descriptor(EntryType::Zero, 0, 1), terminator()]);
        let past_end = blob(3, 2, &[terminator()]);
        let huge = PartitionBlob {
            name: None,
            id: None,
            data: encode_table(0, 1 << 54, &[terminator()]),
        };

        let trailer = trailer(4);
        for parallel in [true, false] {
            let options = ReconstructOptions {
                parallel,
                ..Default::default()
            };
            let image = ImageAssembler::new(&container, &trailer, &options)
                .reconstruct(&[good.clone(), past_end.clone(), huge.clone()])
                .unwrap();

            assert_eq!(image.partitions().len(), 1);
            assert_eq!(image.partitions()[0].index, 0);
            assert!(image.whole_disk()[..512].iter().all(|b| *b == 0));
            let failures = image.failures();
            assert_eq!(failures.len(), 2);
            assert!(matches!(
                failures[0].error,
                UdifError::MalformedChunkTable { partition: 1, .. }
            ));
            assert!(matches!(
                failures[1].error,
                UdifError::MalformedChunkTable { partition: 2, .. }
            ));
        }
    }

    #[test]
    fn test_unallocatable_partition() {
        let container = vec![0u8; 512];
        let huge = PartitionBlob {
            name: None,
            id: None,
            data: encode_table(0, 1 << 54, &[terminator()]),
        };
        let trailer = trailer(1 << 54);
        let options = ReconstructOptions::default();
        let assembler = ImageAssembler::new(&container, &trailer, &options);
        assert!(matches!(
            assembler.assemble_partition(0, &huge, u64::MAX),
            Err(UdifError::MalformedChunkTable { partition: 0, .. })
        ));
    }

    #[test]
    fn test_unallocatable_disk() {
        let container = vec![0u8; 512];
        let trailer = trailer(1 << 54);
        let options = ReconstructOptions::default();
        assert!(matches!(
            ImageAssembler::new(&container, &trailer, &options).reconstruct(&[]),
            Err(UdifError::MalformedTrailer(_))
        ));
    }

    #[test]
    fn test_overlapping_partitions_later_wins() {
        let mut container = vec![0x11u8; 1024];
        container.extend(vec![0x22u8; 512]);
        let first = blob(0, 2, &[raw(0, 2, 0), terminator()]);
        let second = blob(1, 1, &[raw(0, 1, 1024), terminator()]);

        let trailer = trailer(2);
        let options = ReconstructOptions::default();
        let image = ImageAssembler::new(&container, &trailer, &options)
            .reconstruct(&[first, second])
            .unwrap();
        assert!(image.is_complete());
        assert_eq!(image.partitions()[0].disk_range(), 0..1024);
        assert_eq!(image.partitions()[1].disk_range(), 512..1024);
        assert!(image.whole_disk()[..512].iter().all(|b| *b == 0x11));
        assert!(image.whole_disk()[512..].iter().all(|b| *b == 0x22));
    }

    #[test]
    fn test_checksum_verification() {
        let container = vec![0x5Au8; 512];
        let mut table = encode_table(0, 1, &[raw(0, 1, 0), terminator()]);
        let crc = crc32fast::hash(&container);
        table[64..68].copy_from_slice(&crate::trailer::CHECKSUM_TYPE_CRC32.to_be_bytes());
        table[68..72].copy_from_slice(&32u32.to_be_bytes());
        table[72..76].copy_from_slice(&crc.to_be_bytes());
        let good = PartitionBlob {
            name: None,
            id: None,
            data: table.clone(),
        };
        table[72] ^= 0xff;
        let bad = PartitionBlob {
            name: None,
            id: None,
            data: table,
        };

        let trailer = trailer(1);
        let options = ReconstructOptions {
            verify_checksums: true,
            ..Default::default()
        };
        let assembler = ImageAssembler::new(&container, &trailer, &options);
        assert!(assembler.assemble_partition(0, &good, 512).is_ok());
        assert!(matches!(
            assembler.assemble_partition(0, &bad, 512),
            Err(UdifError::ChecksumMismatch { partition: 0, .. })
        ));
    }
}
