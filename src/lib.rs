//! # asdf — reader/writer engine for the ASDF scientific data format
//!
//! An ASDF file pairs a human-readable, tagged YAML header with a stream
//! of length-prefixed binary blocks holding large array payloads.  This
//! crate implements the file engine:
//!
//! - Hybrid-stream framing: the `#ASDF` version line, the YAML region and
//!   its end marker, and magic-anchored block headers with checksums
//! - The block manager: a bidirectional, identity-keyed map between
//!   arrays and blocks, with three storage disciplines (internal blocks,
//!   external sibling files, inline YAML data)
//! - Lazy payloads: block data stays on disk until an array view touches
//!   it; closed engines invalidate outstanding lazy views
//! - In-place updates: a layout planner reuses unchanged block extents on
//!   disk so multi-gigabyte payloads are neither read nor rewritten
//! - A tagged-tree bridge with schema validation, default fill/removal,
//!   JSON-style references with an external-file cache, and per-tag hooks
//!
//! Format guarantees:
//! - All block header fields are big-endian; the checksum is a 16-byte
//!   digest of the uncompressed payload (all zeros when absent)
//! - `allocated_size >= used_size`; the difference is reserved padding an
//!   update may grow into without moving the block
//! - Block order on disk equals order of first discovery, and ordinal
//!   `source` indices are stable across one write

pub mod asdf;
pub mod block;
pub mod compression;
pub mod constants;
pub mod error;
pub mod extension;
pub mod generic_io;
pub mod header;
pub mod ndarray;
pub mod reference;
pub mod schema;
pub mod treeutil;
pub mod value;
pub mod yamlutil;

// Flat re-exports for the most common types.
pub use asdf::{AsdfFile, ExternalCache, ExternalTarget, OpenOptions, WriteOptions};
pub use block::manager::{BlockKey, BlockManager, BlockSource};
pub use block::{ArrayStorage, Block, BlockBody, BlockHeader, Handle};
pub use compression::Compression;
pub use error::{AsdfError, Result};
pub use extension::{ExtensionList, Hook, HookKind};
pub use generic_io::{GenericIo, InputStream, MemoryIo, Mode, Pad};
pub use header::Version;
pub use ndarray::{Dtype, Endian, NdArray};
pub use value::{Mapping, Value};
