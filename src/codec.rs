//! Bounds checked primitive decoding.
//!
//! Every variable length or fixed size read goes through `CursorExt`. Reads
//! either succeed completely or fail without moving the cursor.

use std::io::Cursor;

use crate::errors::{Error, Result};

/// Swap the byte order of a value.
pub trait SwapBytes: Copy {
    fn swap(self) -> Self;
}

macro_rules! impl_swap_bytes {
    ($($t:ty),*) => {
        $(
            impl SwapBytes for $t {
                fn swap(self) -> Self {
                    self.swap_bytes()
                }
            }
        )*
    };
}

impl_swap_bytes!(u16, u32, u64, i16, i32, i64);

/// Swap `value` when `flag` is set, used for raw words read in host order.
pub fn byteswap_if<T: SwapBytes>(flag: bool, value: T) -> T {
    if flag {
        value.swap()
    } else {
        value
    }
}

/// Copy `dest.len()` bytes from `src[offset..]`, or fail without touching `dest`.
pub fn safe_copy(src: &[u8], offset: usize, dest: &mut [u8]) -> Result<()> {
    match offset.checked_add(dest.len()) {
        Some(end) if end <= src.len() => {
            dest.copy_from_slice(&src[offset..end]);

            Ok(())
        }
        _ => Err(Error::Truncated {
            offset: offset as u64,
            needed: dest.len(),
            available: src.len().saturating_sub(offset),
        }),
    }
}

pub trait CursorExt {
    /// Bytes left between the position and the end of the buffer.
    fn remaining(&self) -> usize;

    /// Fail with a truncation unless `len` bytes are available.
    fn ensure(&self, len: usize) -> Result<()>;

    fn safe_copy(&mut self, dest: &mut [u8]) -> Result<()>;

    fn read_uleb128(&mut self) -> Result<u64>;

    fn read_sleb128(&mut self) -> Result<i64>;

    /// Read a NUL terminated string, which must terminate inside the buffer.
    fn read_cstr(&mut self) -> Result<String>;

    /// Read a NUL padded string of exactly `len` bytes.
    fn read_fixed_size_string(&mut self, len: usize) -> Result<String>;

    fn skip(&mut self, len: usize) -> Result<()>;
}

impl<T> CursorExt for Cursor<T>
where
    T: AsRef<[u8]>,
{
    fn remaining(&self) -> usize {
        let len = self.get_ref().as_ref().len() as u64;

        len.saturating_sub(self.position()) as usize
    }

    fn ensure(&self, len: usize) -> Result<()> {
        let available = self.remaining();

        if available < len {
            Err(Error::Truncated {
                offset: self.position(),
                needed: len,
                available,
            })
        } else {
            Ok(())
        }
    }

    fn safe_copy(&mut self, dest: &mut [u8]) -> Result<()> {
        self.ensure(dest.len())?;

        let pos = self.position() as usize;

        dest.copy_from_slice(&self.get_ref().as_ref()[pos..pos + dest.len()]);
        self.set_position((pos + dest.len()) as u64);

        Ok(())
    }

    fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.position();
        let buf = self.get_ref().as_ref();
        let mut pos = start as usize;
        let mut v = 0u64;
        let mut bits = 0;

        loop {
            let b = match buf.get(pos) {
                Some(&b) => b,
                None => return Err(Error::malformed(start, "uleb128 runs past the end")),
            };
            let n = u64::from(b & 0x7F);

            pos += 1;

            if bits >= 64 || (bits > 57 && (n >> (64 - bits)) != 0) {
                return Err(Error::NumberOverflow);
            }

            v |= n << bits;
            bits += 7;

            if (b & 0x80) == 0 {
                break;
            }
        }

        self.set_position(pos as u64);

        Ok(v)
    }

    fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.position();
        let buf = self.get_ref().as_ref();
        let mut pos = start as usize;
        let mut v = 0i64;
        let mut bits = 0;
        let mut b;

        loop {
            b = match buf.get(pos) {
                Some(&b) => b,
                None => return Err(Error::malformed(start, "sleb128 runs past the end")),
            };

            pos += 1;

            if bits >= 64 {
                return Err(Error::NumberOverflow);
            }

            v |= i64::from(b & 0x7F) << bits;
            bits += 7;

            if (b & 0x80) == 0 {
                break;
            }
        }

        // sign extend negative numbers
        if (b & 0x40) != 0 && bits < 64 {
            v |= -1i64 << bits;
        }

        self.set_position(pos as u64);

        Ok(v)
    }

    fn read_cstr(&mut self) -> Result<String> {
        let start = self.position();
        let buf = self.get_ref().as_ref();

        if start as usize > buf.len() {
            return Err(Error::malformed(start, "string starts past the end"));
        }

        let tail = &buf[start as usize..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::malformed(start, "unterminated string"))?;
        let s = String::from_utf8_lossy(&tail[..len]).into_owned();

        self.set_position(start + len as u64 + 1);

        Ok(s)
    }

    fn read_fixed_size_string(&mut self, len: usize) -> Result<String> {
        self.ensure(len)?;

        let pos = self.position() as usize;
        let raw = &self.get_ref().as_ref()[pos..pos + len];
        let s = fixed_size_string(raw);

        self.set_position((pos + len) as u64);

        Ok(s)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure(len)?;
        self.set_position(self.position() + len as u64);

        Ok(())
    }
}

/// Decode a NUL padded name such as `segname[16]`.
pub fn fixed_size_string(raw: &[u8]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

    String::from_utf8_lossy(&raw[..len]).into_owned()
}
