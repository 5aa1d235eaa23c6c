use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Result of a single chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole chunk reached the file
    Written(usize),
    /// The filesystem ran out of space after `written` bytes of the chunk
    DiskFull { written: usize },
}

impl WriteOutcome {
    pub fn bytes(&self) -> usize {
        match self {
            WriteOutcome::Written(n) => *n,
            WriteOutcome::DiskFull { written } => *written,
        }
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, WriteOutcome::DiskFull { .. })
    }
}

/// Filesystem operations used by the writers and readers
pub trait DiskIO: Send + Sync {
    /// Create or truncate a file for writing
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn DirectFile>>;

    /// Open a file for appending, creating it if missing
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn DirectFile>>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn DirectFile>>;

    /// On-disk size of a file
    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Bytes available to this process on the filesystem holding `path`
    fn free_space(&self, path: &Path) -> io::Result<u64>;

    /// Total capacity of the filesystem holding `path`
    fn total_space(&self, path: &Path) -> io::Result<u64>;

    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Open file handle trait
pub trait DirectFile: Send {
    /// Write the whole chunk, reporting disk-full instead of failing
    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<WriteOutcome>;

    /// Read up to `buf.len()` bytes, short only at end of file
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Force synchronization to disk
    fn sync_all(&mut self) -> io::Result<()>;
}

/// True when an I/O error means the filesystem is out of space
pub fn is_disk_full(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WriteZero {
        return true;
    }
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == libc::ENOSPC || code == libc::EDQUOT,
        // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
        #[cfg(windows)]
        Some(code) => code == 39 || code == 112,
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}

/// Path whose filesystem should be queried for space: the file itself if
/// it exists, otherwise the nearest existing ancestor.
fn space_query_path(path: &Path) -> &Path {
    let mut candidate = path;
    loop {
        if candidate.exists() {
            return candidate;
        }
        match candidate.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => candidate = parent,
            _ => return Path::new("."),
        }
    }
}

/// std file handle
pub struct PlatformFile {
    file: File,
}

impl PlatformFile {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl DirectFile for PlatformFile {
    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        let mut written = 0;
        while written < buf.len() {
            match self.file.write(&buf[written..]) {
                Ok(0) => return Ok(WriteOutcome::DiskFull { written }),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disk_full(&e) => return Ok(WriteOutcome::DiskFull { written }),
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome::Written(written))
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Buffered std + fs2 implementation.
///
/// Chunk sizes are arbitrary here (1 KiB up to 48 MiB and beyond), so files
/// are not opened with O_DIRECT / FILE_FLAG_NO_BUFFERING, which would demand
/// sector-aligned buffers and lengths.
#[derive(Debug, Clone, Default)]
pub struct PlatformDiskIO;

impl PlatformDiskIO {
    pub fn new() -> Self {
        Self
    }
}

impl DiskIO for PlatformDiskIO {
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(PlatformFile::new(file)))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Box::new(PlatformFile::new(file)))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(PlatformFile::new(file)))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn free_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(space_query_path(path))
    }

    fn total_space(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(space_query_path(path))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Create a new platform disk I/O instance
pub fn create_disk_io() -> PlatformDiskIO {
    PlatformDiskIO::new()
}
