//! Crate-wide error type.
//!
//! Every fallible operation returns [`Result`].  Positional details (byte
//! offset, block index, tree pointer) are carried in the variants when they
//! are known at the failure site.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AsdfError>;

#[derive(Error, Debug)]
pub enum AsdfError {
    #[error("does not appear to be an ASDF file")]
    NotAsdf,

    #[error("ASDF file appears to contain garbage after the header")]
    GarbageAfterHeader,

    #[error("invalid block magic at byte offset {offset}")]
    BadMagic { offset: u64 },

    #[error("block header size {size} below minimum {min}")]
    HeaderTooSmall { size: u16, min: u16 },

    #[error("checksum mismatch for block {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("unknown compression code {code:?}")]
    UnknownCompression { code: String },

    #[error("unknown array storage class {0:?}")]
    UnknownStorageClass(String),

    #[error("array can not be stored inline: {0}")]
    CannotInline(String),

    #[error("can not write external blocks: no usable base URI")]
    NoBaseUri,

    #[error("associated file is not writable")]
    NotWritable,

    #[error("associated file is not seekable")]
    NotSeekable,

    #[error("no associated file, or the file has been closed")]
    NotOpen,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad type: {0}")]
    BadType(String),

    #[error("schema violation at {pointer}: {message}")]
    SchemaViolation { pointer: String, message: String },

    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AsdfError {
    /// Shorthand for wrapping a free-form message as an I/O failure.
    pub(crate) fn io_invalid(msg: impl Into<String>) -> Self {
        AsdfError::Io(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
    }
}
