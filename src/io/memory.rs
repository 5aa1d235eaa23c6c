//! In-memory `DiskIO` with a fixed capacity, for exercising disk-full paths

use super::disk::{DirectFile, DiskIO, WriteOutcome};
use crate::cancel::CancellationToken;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Volume {
    capacity: u64,
    files: HashMap<PathBuf, Vec<u8>>,
    writes: u64,
    /// Added to reported free space, like blocks the filesystem cannot hand out
    slack: u64,
    cancel_after: Option<(u64, CancellationToken)>,
}

impl Volume {
    fn used(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDiskIO {
    volume: Arc<Mutex<Volume>>,
}

impl MemoryDiskIO {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            volume: Arc::new(Mutex::new(Volume {
                capacity,
                ..Volume::default()
            })),
        }
    }

    /// Report `slack` more free bytes than can actually be written
    pub fn with_reported_slack(self, slack: u64) -> Self {
        self.lock().slack = slack;
        self
    }

    /// Set `token` once `writes` chunk writes have completed
    pub fn cancel_after_writes(&self, writes: u64, token: CancellationToken) {
        self.lock().cancel_after = Some((writes, token));
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn insert(&self, path: &Path, data: Vec<u8>) {
        self.lock().files.insert(path.to_path_buf(), data);
    }

    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Volume> {
        self.volume.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open(&self, path: &Path, truncate: bool, must_exist: bool) -> io::Result<Box<dyn DirectFile>> {
        let mut volume = self.lock();
        if must_exist && !volume.files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        let entry = volume.files.entry(path.to_path_buf()).or_default();
        if truncate {
            entry.clear();
        }
        let pos = if must_exist { 0 } else { entry.len() as u64 };
        Ok(Box::new(MemoryFile {
            disk: self.clone(),
            path: path.to_path_buf(),
            pos,
        }))
    }
}

struct MemoryFile {
    disk: MemoryDiskIO,
    path: PathBuf,
    pos: u64,
}

impl DirectFile for MemoryFile {
    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        let mut volume = self.disk.lock();
        let free = volume.capacity.saturating_sub(volume.used());
        let n = buf.len().min(free as usize);
        let file = volume.files.entry(self.path.clone()).or_default();
        let start = self.pos as usize;
        if file.len() < start + n {
            file.resize(start + n, 0);
        }
        file[start..start + n].copy_from_slice(&buf[..n]);
        self.pos += n as u64;

        volume.writes += 1;
        if let Some((after, token)) = &volume.cancel_after {
            if volume.writes >= *after {
                token.cancel();
            }
        }

        if n < buf.len() {
            Ok(WriteOutcome::DiskFull { written: n })
        } else {
            Ok(WriteOutcome::Written(n))
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let volume = self.disk.lock();
        let file = volume
            .files
            .get(&self.path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file removed"))?;
        let start = (self.pos as usize).min(file.len());
        let n = buf.len().min(file.len() - start);
        buf[..n].copy_from_slice(&file[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(p) => self.pos = p,
            _ => return Err(io::Error::new(io::ErrorKind::Unsupported, "absolute seeks only")),
        }
        Ok(self.pos)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DiskIO for MemoryDiskIO {
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        self.open(path, true, false)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        self.open(path, false, false)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn DirectFile>> {
        self.open(path, false, true)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        self.lock()
            .files
            .get(path)
            .map(|f| f.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        let volume = self.lock();
        Ok(volume.capacity.saturating_sub(volume.used()) + volume.slack)
    }

    fn total_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.lock().capacity)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }
}
