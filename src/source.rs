//! Random-access byte sources
//!
//! The reconstruction only ever needs two things from the container: its total
//! size and bounded reads at arbitrary offsets. [`ByteSource`] captures exactly
//! that, and is `Send + Sync` so decode workers can share one source.
//!

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    sync::Mutex,
};

/// Read-only, random-access view over a container or reference image.
pub trait ByteSource: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] when `offset + len` lies past
    /// the end of the source; a read never partially succeeds.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

/// Checks that `[offset, offset + len)` lies inside a source of `size` bytes.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "read of {} bytes at offset 0x{:x} exceeds source size (0x{:x})",
                len, offset, size
            ),
        )),
    }
}

impl ByteSource for [u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        check_range(offset, len, self.size())?;
        let start = offset as usize;
        Ok(self[start..start + len].to_vec())
    }
}

impl ByteSource for Vec<u8> {
    fn size(&self) -> u64 {
        self.as_slice().size()
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.as_slice().read_at(offset, len)
    }
}

/// A [`File`] exposed as a [`ByteSource`].
///
/// The handle sits behind a mutex so that concurrent readers each perform an
/// atomic seek-then-read; the file is never written to.
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    /// Opens the file at `file_path` for reading.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] produced by [`File::open`] or while querying
    /// the file metadata.
    pub fn new<P: AsRef<Path>>(file_path: P) -> io::Result<FileSource> {
        let file = File::open(file_path.as_ref())?;
        FileSource::from_file(file)
    }

    /// Wraps an already opened file.
    pub fn from_file(file: File) -> io::Result<FileSource> {
        let size = file.metadata()?.len();
        Ok(FileSource {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        check_range(offset, len, self.size)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "file handle lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}
