//! Random access byte readers.
//!
//! Every parser in this crate reads through `ByteSource`, so the same code works
//! on a file, on process memory supplied by a debugger, or on a sub-image of a
//! shared cache or kernelcache.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::errors::{Error, Result};

/// A random access reader.
///
/// `read_at` returns the number of bytes copied into `buf`; a short count
/// means the end of the data was reached, never a transient failure.
pub trait ByteSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;

    /// Total size in bytes, if known.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Fill the whole buffer or report a truncation.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf);

        if n < buf.len() {
            Err(Error::Truncated {
                offset,
                needed: buf.len(),
                available: n,
            })
        } else {
            Ok(())
        }
    }

    /// Read up to `len` bytes, returning whatever is available.
    fn read_clamped(&self, offset: u64, len: usize) -> Vec<u8> {
        let len = match self.size() {
            Some(size) if offset >= size => 0,
            Some(size) => len.min((size - offset) as usize),
            None => len,
        };
        let mut buf = vec![0; len];
        let n = self.read_at(offset, &mut buf);

        buf.truncate(n);
        buf
    }

    /// Read exactly `len` bytes.
    fn read_vec_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buf = self.read_clamped(offset, len);

        if buf.len() < len {
            Err(Error::Truncated {
                offset,
                needed: len,
                available: buf.len(),
            })
        } else {
            Ok(buf)
        }
    }
}

impl ByteSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        if offset >= self.len() as u64 {
            return 0;
        }

        let data = &self[offset as usize..];
        let n = data.len().min(buf.len());

        buf[..n].copy_from_slice(&data[..n]);
        n
    }

    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

impl ByteSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        self.as_slice().read_at(offset, buf)
    }

    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

impl<'a, S: ByteSource + ?Sized> ByteSource for &'a S {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        (**self).read_at(offset, buf)
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

/// A file on disk, read with seek + read.
pub struct FileSource {
    file: RefCell<File>,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileSource> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        Ok(FileSource {
            file: RefCell::new(file),
            size,
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let mut file = self.file.borrow_mut();

        if file.seek(SeekFrom::Start(offset)).is_err() {
            return 0;
        }

        let mut total = 0;

        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("fail to read {} bytes at 0x{:x}, {}", buf.len(), offset, err);

                    break;
                }
            }
        }

        total
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// A window `[base, base + len)` of another source, addressed from zero.
pub struct SubSource<S> {
    inner: S,
    base: u64,
    len: Option<u64>,
}

impl<S: ByteSource> SubSource<S> {
    pub fn new(inner: S, base: u64, len: Option<u64>) -> Self {
        SubSource { inner, base, len }
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl<S: ByteSource> ByteSource for SubSource<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let want = match self.len {
            Some(len) if offset >= len => return 0,
            Some(len) => buf.len().min((len - offset) as usize),
            None => buf.len(),
        };

        match self.base.checked_add(offset) {
            Some(off) => self.inner.read_at(off, &mut buf[..want]),
            None => 0,
        }
    }

    fn size(&self) -> Option<u64> {
        match (self.len, self.inner.size()) {
            (Some(len), _) => Some(len),
            (None, Some(size)) => Some(size.saturating_sub(self.base)),
            (None, None) => None,
        }
    }
}
