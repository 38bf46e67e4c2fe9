//! Unix driver over `std::fs` with positional I/O.
//!
//! No advisory locking is taken here: a single writer per container is
//! enforced above this layer.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tailspace_error::{Result, TailspaceError};
use tailspace_types::OpenFlags;
use tracing::debug;

use crate::traits::{VfdFile, Vfs};

/// Driver for ordinary files on a Unix filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixVfs;

impl UnixVfs {
    pub const fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Self::File> {
        let writable = flags.is_writable();
        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        if writable {
            options
                .create(flags.contains(OpenFlags::CREATE))
                .truncate(flags.contains(OpenFlags::TRUNCATE));
        }

        let file = options.open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => TailspaceError::CannotOpen {
                path: path.to_path_buf(),
            },
            _ => TailspaceError::Io(e),
        })?;
        debug!(path = %path.display(), writable, "unix vfd opened");

        Ok(UnixFile {
            file: Some(file),
            readonly: !writable,
        })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TailspaceError::Io(e)),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.try_exists()?)
    }
}

/// A file handle in the Unix driver.
#[derive(Debug)]
pub struct UnixFile {
    file: Option<File>,
    readonly: bool,
}

impl UnixFile {
    fn handle(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| TailspaceError::internal("unix vfd used after close"))
    }

    fn writable_handle(&self) -> Result<&File> {
        if self.readonly {
            return Err(TailspaceError::ReadOnly);
        }
        self.handle()
    }
}

impl VfdFile for UnixFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.handle()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TailspaceError::Io(e)),
            }
        }
        buf[filled..].fill(0);
        Ok(filled)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.writable_handle()?.write_all_at(buf, offset)?;
        Ok(())
    }

    fn get_eof(&self) -> Result<u64> {
        Ok(self.handle()?.metadata()?.len())
    }

    fn set_eof(&mut self, len: u64) -> Result<()> {
        self.writable_handle()?.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.handle()?.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}
