use diskpak::bench::{read_rand, read_seq, write_burnin, write_fulpak, IoOptions};
use diskpak::cancel::CancellationToken;
use diskpak::error::{is_cancellation, user_friendly_message};
use diskpak::io::disk::{DirectFile, DiskIO, PlatformDiskIO, WriteOutcome};
use diskpak::pattern::{generate, FillPolicy};
use diskpak::{DiskPakError, KB, MB};
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

/// Real files on a pretend volume of `capacity` bytes holding one data file
struct CappedDisk {
    inner: PlatformDiskIO,
    capacity: u64,
    used: Arc<AtomicU64>,
}

impl CappedDisk {
    fn new(capacity: u64) -> Self {
        Self {
            inner: PlatformDiskIO::new(),
            capacity,
            used: Arc::new(AtomicU64::new(0)),
        }
    }

    fn wrap(&self, file: Box<dyn DirectFile>) -> Box<dyn DirectFile> {
        Box::new(CappedFile {
            inner: file,
            capacity: self.capacity,
            used: Arc::clone(&self.used),
        })
    }
}

struct CappedFile {
    inner: Box<dyn DirectFile>,
    capacity: u64,
    used: Arc<AtomicU64>,
}

impl DirectFile for CappedFile {
    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        let free = self.capacity - self.used.load(Ordering::SeqCst);
        let n = buf.len().min(free as usize);
        let outcome = self.inner.write_chunk(&buf[..n])?;
        self.used.fetch_add(outcome.bytes() as u64, Ordering::SeqCst);
        if n < buf.len() {
            Ok(WriteOutcome::DiskFull { written: outcome.bytes() })
        } else {
            Ok(outcome)
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_chunk(buf)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek_to(pos)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.inner.sync_all()
    }
}

impl DiskIO for CappedDisk {
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        self.used.store(0, Ordering::SeqCst);
        Ok(self.wrap(self.inner.open_write(path)?))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        let existing = self.inner.file_size(path).unwrap_or(0);
        self.used.store(existing, Ordering::SeqCst);
        Ok(self.wrap(self.inner.open_append(path)?))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        self.inner.open_read(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        self.inner.file_size(path)
    }

    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.capacity - self.used.load(Ordering::SeqCst))
    }

    fn total_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.capacity)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.used.store(0, Ordering::SeqCst);
        self.inner.remove(path)
    }
}

#[test]
fn test_burnin_then_read_seq_constant_buffer() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.dat");
    let disk = PlatformDiskIO::new();
    let token = CancellationToken::new();
    let buffer = generate(16 * KB, FillPolicy::Constant(42), &token).unwrap();
    let options = IoOptions::default().with_chunk_size(4096).with_keep_data(true);

    let written = write_burnin(&disk, &buffer, &path, &options, &token).unwrap();
    let read = read_seq(&disk, &buffer, &path, &options, &token).unwrap();

    assert_eq!(written.bytes_transferred, 16384);
    assert_eq!(read.bytes_transferred, 16384);
    assert!(std::fs::read(&path).unwrap().iter().all(|&b| b == 42));
}

#[test]
fn test_burnin_round_trip_random_reads() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.dat");
    let disk = PlatformDiskIO::new();
    let token = CancellationToken::new();
    let buffer = generate(64 * KB, FillPolicy::Random, &token).unwrap();

    let options = IoOptions::default().with_chunk_size(8192).with_keep_data(true);
    write_burnin(&disk, &buffer, &path, &options, &token).unwrap();

    for chunk_size in [1024usize, 4096, 16384, 65536] {
        let options = options.clone().with_chunk_size(chunk_size);
        let seq = read_seq(&disk, &buffer, &path, &options, &token).unwrap();
        let rand = read_rand(&disk, &buffer, &path, &options, &token).unwrap();
        assert_eq!(seq.bytes_transferred, 64 * KB);
        assert_eq!(rand.bytes_transferred, 64 * KB);
    }
}

#[test]
fn test_fulpak_round_trip_on_capped_volume() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.dat");
    let disk = CappedDisk::new(3 * MB + 100 * KB);
    let token = CancellationToken::new();
    let buffer = generate(256 * KB, FillPolicy::Random, &token).unwrap();
    let options = IoOptions::default().with_chunk_size(64 * 1024).with_keep_data(true);

    let stats = write_fulpak(&disk, &buffer, &path, &options, &token).unwrap();

    // Twelve whole repetitions fit; the remainder is smaller than the last slice
    assert_eq!(stats.bytes_transferred, 3 * MB);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * MB);

    let seq = read_seq(&disk, &buffer, &path, &options, &token).unwrap();
    let rand = read_rand(&disk, &buffer, &path, &options, &token).unwrap();
    assert_eq!(seq.bytes_transferred, 3 * MB);
    assert_eq!(rand.bytes_transferred, 3 * MB);
    assert_eq!(rand.operations, 3 * MB / (64 * KB));
}

#[test]
fn test_corruption_is_reported() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.dat");
    let disk = PlatformDiskIO::new();
    let token = CancellationToken::new();
    let buffer = generate(8 * KB, FillPolicy::Constant(7), &token).unwrap();

    let mut bytes = buffer.as_bytes().to_vec();
    bytes[6000] = 8;
    std::fs::write(&path, bytes).unwrap();

    let options = IoOptions::default().with_chunk_size(2048);
    let err = read_seq(&disk, &buffer, &path, &options, &token).unwrap_err();
    match &err {
        DiskPakError::DataIntegrity(report) => {
            assert_eq!(report.offset, 4096);
            assert_eq!(report.mismatches[0].index, 6000 - 4096);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(user_friendly_message(&err).contains("does not match"));
    assert!(!is_cancellation(&err));
}

#[test]
fn test_missing_data_file_is_io_error() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("missing.dat");
    let token = CancellationToken::new();
    let buffer = generate(KB, FillPolicy::Random, &token).unwrap();

    let err = read_seq(&PlatformDiskIO::new(), &buffer, &path, &IoOptions::default(), &token)
        .unwrap_err();
    assert!(matches!(err, DiskPakError::IoError(_)));
}

#[test]
fn test_pre_cancelled_writer_leaves_empty_file() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.dat");
    let token = CancellationToken::new();
    let buffer = generate(MB, FillPolicy::Random, &token).unwrap();
    token.cancel();

    let options = IoOptions::default().with_keep_data(true);
    let stats = write_burnin(&PlatformDiskIO::new(), &buffer, &path, &options, &token).unwrap();
    assert!(stats.cancelled);
    assert_eq!(stats.bytes_transferred, 0);
}
