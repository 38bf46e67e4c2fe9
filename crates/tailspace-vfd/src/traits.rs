use std::path::Path;

use tailspace_error::Result;
use tailspace_types::OpenFlags;

/// A virtual file driver.
///
/// Abstracts how member files are opened so the allocation layer can run
/// over real files (Unix) or in-memory storage (testing).
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this driver.
    type File: VfdFile;

    /// The name of this driver (e.g., "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// Without `OpenFlags::CREATE` a missing file is `CannotOpen`.
    /// `OpenFlags::TRUNCATE` discards existing contents.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Self::File>;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool>;
}

/// A file handle opened by a [`Vfs`].
///
/// Only the EOF contract and positional I/O are consumed; locking and
/// caching are the caller's concern.
pub trait VfdFile: Send + Sync {
    /// Read `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read. If fewer bytes are read
    /// than requested (short read), the remaining bytes in `buf` are zeroed.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` starting at byte offset `offset`, extending the file if
    /// needed.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Current physical length of the file in bytes.
    fn get_eof(&self) -> Result<u64>;

    /// Set the physical length of the file, shrinking or zero-extending it.
    fn set_eof(&mut self, len: u64) -> Result<()>;

    /// Sync the file contents to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Close the file. The handle must not be used afterwards.
    fn close(&mut self) -> Result<()>;

    /// Whether the handle was opened without write access.
    fn is_readonly(&self) -> bool {
        false
    }
}
