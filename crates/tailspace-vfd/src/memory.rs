use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tailspace_error::{Result, TailspaceError};
use tailspace_types::OpenFlags;

use crate::traits::{VfdFile, Vfs};

/// Shared storage for one file in the memory driver.
#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
}

/// Shared state for the entire memory driver.
#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileStorage>>>,
}

/// An in-memory driver for testing.
///
/// Files outlive their handles, so a container can be closed and reopened
/// through the same `MemoryVfs` (clones share the same files).
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryVfs {
    /// Create a new empty in-memory driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents of `path`, if it exists.
    pub fn snapshot(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let storage = self
            .inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .get(path)
            .cloned();
        match storage {
            Some(storage) => Ok(Some(storage.lock().map_err(|_| lock_err())?.data.clone())),
            None => Ok(None),
        }
    }
}

fn lock_err() -> TailspaceError {
    TailspaceError::internal("MemoryVfs lock poisoned")
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Self::File> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;

        let storage = if let Some(existing) = inner.files.get(path) {
            Arc::clone(existing)
        } else if flags.contains(OpenFlags::CREATE) {
            let storage = Arc::new(Mutex::new(FileStorage::default()));
            inner.files.insert(path.to_path_buf(), Arc::clone(&storage));
            storage
        } else {
            return Err(TailspaceError::CannotOpen {
                path: path.to_path_buf(),
            });
        };
        drop(inner);

        if flags.contains(OpenFlags::TRUNCATE) {
            storage.lock().map_err(|_| lock_err())?.data.clear();
        }

        Ok(MemoryFile {
            storage,
            readonly: !flags.is_writable(),
        })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .contains_key(path))
    }
}

/// A file handle in the memory driver.
#[derive(Debug)]
pub struct MemoryFile {
    storage: Arc<Mutex<FileStorage>>,
    readonly: bool,
}

impl VfdFile for MemoryFile {
    #[allow(clippy::cast_possible_truncation)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let storage = self.storage.lock().map_err(|_| lock_err())?;

        let offset = offset as usize;
        let file_len = storage.data.len();

        if offset >= file_len {
            drop(storage);
            buf.fill(0);
            return Ok(0);
        }

        let available = file_len - offset;
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&storage.data[offset..offset + to_read]);
        drop(storage);

        // Zero-fill the rest if short read.
        if to_read < buf.len() {
            buf[to_read..].fill(0);
        }

        Ok(to_read)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if self.readonly {
            return Err(TailspaceError::ReadOnly);
        }
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;

        let offset = offset as usize;
        let end = offset + buf.len();

        if end > storage.data.len() {
            storage.data.resize(end, 0);
        }

        storage.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn get_eof(&self) -> Result<u64> {
        Ok(self.storage.lock().map_err(|_| lock_err())?.data.len() as u64)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_eof(&mut self, len: u64) -> Result<()> {
        if self.readonly {
            return Err(TailspaceError::ReadOnly);
        }
        self.storage
            .lock()
            .map_err(|_| lock_err())?
            .data
            .resize(len as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}
