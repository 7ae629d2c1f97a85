#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::types::{Result, StorageError};

/// Chunk size used when streaming file ranges into an archive.
const COPY_CHUNK_LEN: usize = 256 * 1024;

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` starting at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Streams the first `len` bytes of the file into `out`.
    fn copy_prefix_to(&self, len: u64, out: &mut dyn Write) -> Result<u64> {
        let mut buf = vec![0u8; COPY_CHUNK_LEN];
        let mut off = 0u64;
        while off < len {
            let chunk = (len - off).min(COPY_CHUNK_LEN as u64) as usize;
            self.read_at(off, &mut buf[..chunk])?;
            out.write_all(&buf[..chunk])?;
            off += chunk as u64;
        }
        Ok(off)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(dst, off)
}

#[cfg(unix)]
fn write_all_at(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(src, off)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "seek_read reached EOF",
            ));
        }
        dst = &mut dst[read..];
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positioned reads unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positioned writes unsupported on this platform",
    ))
}

/// Standard file I/O implementation sharing one handle through an `Arc`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    path: PathBuf,
}

impl StdFileIo {
    /// Opens or creates `path` for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::from_file(file, path))
    }

    /// Opens an existing file for read-write access.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self {
            inner: Arc::new(file),
            path: path.to_path_buf(),
        }
    }

    /// Returns the path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        read_exact_at(&self.inner, off, dst).map_err(StorageError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all_at(&self.inner, off, src).map_err(StorageError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StorageError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StorageError::from)
    }
}
