use std::io;
use std::str;
use std::string;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fail to do I/O operations, {0}.")]
    IoError(#[from] io::Error),

    #[error("fail to interpret a sequence of u8 as a string, {0}.")]
    Utf8Error(#[from] str::Utf8Error),

    #[error("fail to convert a String from a UTF-8 byte vector, {0}.")]
    FromUtf8Error(#[from] string::FromUtf8Error),

    #[error("truncated at offset 0x{offset:x}, need {needed} bytes but only {available} available.")]
    Truncated { offset: u64, needed: usize, available: usize },

    #[error("buffer overflow, {0}.")]
    BufferOverflow(usize),

    #[error("number overflowing.")]
    NumberOverflow,

    #[error("malformed encoding at offset 0x{offset:x}, {reason}.")]
    MalformedEncoding { offset: u64, reason: String },

    #[error("inconsistent structure, {0}.")]
    InconsistentStructure(String),

    #[error("unknown file magic 0x{0:08x}.")]
    UnknownMagic(u32),

    #[error("invalid dyld cache magic.")]
    InvalidCacheMagic,

    #[error("not found, {0}.")]
    NotFound(String),

    #[error("cancelled by the caller.")]
    Cancelled,

    #[error("fail to load, {0}.")]
    LoadError(String),
}

impl Error {
    pub(crate) fn malformed<S: Into<String>>(offset: u64, reason: S) -> Self {
        Error::MalformedEncoding {
            offset,
            reason: reason.into(),
        }
    }

    /// Whether the error means the input was shorter than declared.
    pub fn is_truncation(&self) -> bool {
        match self {
            Error::Truncated { .. } | Error::BufferOverflow(_) => true,
            Error::IoError(err) => err.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
