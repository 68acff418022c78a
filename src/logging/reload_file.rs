//! Log file that can be reopened in place for external log rotation.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// An append-only log file whose handle can be swapped at runtime.
///
/// Writers and [`ReloadableFile::reopen`] serialize on the same lock, so a
/// write lands either entirely in the old file or entirely in the new one.
/// `Arc<ReloadableFile>` is a `tracing_subscriber` `MakeWriter`.
#[derive(Debug)]
pub struct ReloadableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReloadableFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the path again and swaps the new handle in.
    ///
    /// On failure the current handle stays in place.
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let mut guard = self.lock();
        guard.flush()?;
        let old = std::mem::replace(&mut *guard, fresh);
        drop(guard);
        old.sync_all()
    }

    pub fn sync(&self) -> io::Result<()> {
        self.lock().sync_all()
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for &ReloadableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
