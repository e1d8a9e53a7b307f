//! Binary block framing — header codec, payload bodies, storage classes.
//!
//! # On-disk layout
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic           = d3 42 4c 4b  ("\xd3BLK")
//!    4      2   header_size     >= 40          (BE u16, bytes that follow)
//!    6      4   flags                          (BE u32, reserved)
//!   10      4   compression     4 ASCII chars, NULs when absent
//!   14      8   allocated_size  reserved payload extent      (BE u64)
//!   22      8   used_size       payload bytes on disk        (BE u64)
//!   30      8   data_size       uncompressed payload bytes   (BE u64)
//!   38     16   checksum        MD5 of uncompressed payload; zeros = absent
//!   54    ...   reserved header bytes, then the payload
//! ```
//!
//! The payload occupies `used_size` bytes; `allocated_size - used_size`
//! trailing bytes are reserved padding that an in-place update may grow
//! into.  The next block magic (or EOF) follows `allocated_size` bytes
//! after the header.
//!
//! # Endianness
//! Every numeric field is big-endian.
//!
//! # Payload bodies
//! A [`BlockBody`] owns the payload state: materialized bytes, a lazy
//! seek-and-read source into the file the block was discovered in, or a
//! lazy reference to an external sibling file.  Lazy bodies hold weak
//! references; once the owning engine is closed they fail with `NotOpen`.

pub mod layout;
pub mod manager;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use byteorder::{BigEndian, ByteOrder};
use md5::{Digest, Md5};

use crate::asdf::ExternalCache;
use crate::compression::{self, Compression};
use crate::constants::{
    BLOCK_HEADER_MIN_SIZE, BLOCK_HEADER_SIZE, BLOCK_MAGIC, CHECKSUM_SIZE, NO_CHECKSUM,
};
use crate::error::{AsdfError, Result};
use crate::generic_io::{read_exact, GenericIo, SharedIo};

// ── Storage classes ──────────────────────────────────────────────────────────

/// Where an array's bytes live when the file is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayStorage {
    /// A binary block in this file's block stream.
    Internal,
    /// A binary block in a sibling `<stem>NNNN.asdf` file.
    External,
    /// A nested sequence in the YAML region; no binary block.
    Inline,
}

impl ArrayStorage {
    pub fn name(self) -> &'static str {
        match self {
            ArrayStorage::Internal => "internal",
            ArrayStorage::External => "external",
            ArrayStorage::Inline => "inline",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "internal" => Ok(ArrayStorage::Internal),
            "external" => Ok(ArrayStorage::External),
            "inline" => Ok(ArrayStorage::Inline),
            other => Err(AsdfError::UnknownStorageClass(other.to_string())),
        }
    }
}

// ── Checksums ────────────────────────────────────────────────────────────────

/// 16-byte digest over an uncompressed payload.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    Md5::digest(data).into()
}

// ── Header codec ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub flags: u32,
    pub compression: Option<Compression>,
    pub allocated_size: u64,
    pub used_size: u64,
    pub data_size: u64,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl BlockHeader {
    /// Write magic, header length, and the header fields.
    pub fn write(&self, io: &mut dyn GenericIo) -> Result<()> {
        let mut buf = [0u8; 6 + BLOCK_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&BLOCK_MAGIC);
        BigEndian::write_u16(&mut buf[4..6], BLOCK_HEADER_SIZE);
        BigEndian::write_u32(&mut buf[6..10], self.flags);
        buf[10..14].copy_from_slice(&compression::code_of(self.compression));
        BigEndian::write_u64(&mut buf[14..22], self.allocated_size);
        BigEndian::write_u64(&mut buf[22..30], self.used_size);
        BigEndian::write_u64(&mut buf[30..38], self.data_size);
        buf[38..54].copy_from_slice(&self.checksum);
        io.write_all(&buf)
    }

    /// Read and parse a header.  The caller has already consumed the magic.
    pub fn read(io: &mut dyn GenericIo) -> Result<Self> {
        let mut len_buf = [0u8; 2];
        read_exact(io, &mut len_buf)?;
        let header_size = BigEndian::read_u16(&len_buf);
        if header_size < BLOCK_HEADER_MIN_SIZE {
            return Err(AsdfError::HeaderTooSmall {
                size: header_size,
                min: BLOCK_HEADER_MIN_SIZE,
            });
        }
        if header_size < BLOCK_HEADER_SIZE {
            // Large enough for the historic floor but not for the
            // mandatory fields.
            return Err(AsdfError::HeaderTooSmall {
                size: header_size,
                min: BLOCK_HEADER_SIZE,
            });
        }
        let mut buf = vec![0u8; header_size as usize];
        read_exact(io, &mut buf)?;

        let mut code = [0u8; 4];
        code.copy_from_slice(&buf[4..8]);
        let mut sum = [0u8; CHECKSUM_SIZE];
        sum.copy_from_slice(&buf[32..48]);

        Ok(Self {
            flags: BigEndian::read_u32(&buf[0..4]),
            compression: Compression::from_code(&code)?,
            allocated_size: BigEndian::read_u64(&buf[8..16]),
            used_size: BigEndian::read_u64(&buf[16..24]),
            data_size: BigEndian::read_u64(&buf[24..32]),
            checksum: sum,
        })
    }
}

// ── Payload bodies ───────────────────────────────────────────────────────────

/// Shared, mutable payload state.  Array views hold clones of this handle;
/// the pointer identity of the `Rc` is what maps arrays to blocks.
pub type Handle = Rc<RefCell<BlockBody>>;

pub struct BlockBody {
    state: BodyState,
}

enum BodyState {
    Materialized(Vec<u8>),
    LazyStream {
        io: Weak<RefCell<Box<dyn GenericIo>>>,
        payload_offset: u64,
        used_size: u64,
        data_size: u64,
        compression: Option<Compression>,
    },
    LazyExternal {
        cache: Weak<RefCell<ExternalCache>>,
        uri: String,
    },
}

impl BlockBody {
    pub fn materialized(bytes: Vec<u8>) -> Handle {
        Rc::new(RefCell::new(Self {
            state: BodyState::Materialized(bytes),
        }))
    }

    pub fn lazy_stream(
        io: &SharedIo,
        payload_offset: u64,
        used_size: u64,
        data_size: u64,
        compression: Option<Compression>,
    ) -> Handle {
        Rc::new(RefCell::new(Self {
            state: BodyState::LazyStream {
                io: Rc::downgrade(io),
                payload_offset,
                used_size,
                data_size,
                compression,
            },
        }))
    }

    pub fn lazy_external(cache: &Rc<RefCell<ExternalCache>>, uri: String) -> Handle {
        Rc::new(RefCell::new(Self {
            state: BodyState::LazyExternal {
                cache: Rc::downgrade(cache),
                uri,
            },
        }))
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.state, BodyState::Materialized(_))
    }

    /// Does this payload still live in the host file's own stream?
    pub fn is_lazy_stream(&self) -> bool {
        matches!(self.state, BodyState::LazyStream { .. })
    }

    /// Uncompressed byte length, when known without loading.
    pub fn known_len(&self) -> Option<u64> {
        match &self.state {
            BodyState::Materialized(b) => Some(b.len() as u64),
            BodyState::LazyStream { data_size, .. } => Some(*data_size),
            BodyState::LazyExternal { .. } => None,
        }
    }

    fn materialize(&mut self) -> Result<()> {
        let bytes = match &self.state {
            BodyState::Materialized(_) => return Ok(()),
            BodyState::LazyStream {
                io,
                payload_offset,
                used_size,
                data_size,
                compression,
            } => {
                let io = io.upgrade().ok_or(AsdfError::NotOpen)?;
                let mut io = io.borrow_mut();
                let orig = io.tell()?;
                let result = (|| {
                    io.seek(*payload_offset)?;
                    let mut raw = vec![0u8; *used_size as usize];
                    read_exact(io.as_mut(), &mut raw)?;
                    compression::decompress(&raw, *compression, *data_size as usize)
                })();
                // Restore the shared stream position regardless of outcome.
                let _ = io.seek(orig);
                result?
            }
            BodyState::LazyExternal { cache, uri } => {
                let cache = cache.upgrade().ok_or(AsdfError::NotOpen)?;
                let external = cache.borrow_mut().load(uri)?;
                let handle = {
                    let ext = external.borrow();
                    ext.blocks()
                        .block(0)
                        .ok_or_else(|| {
                            AsdfError::NotFound(format!("no block in external file {uri}"))
                        })?
                        .handle()
                };
                let bytes = handle.borrow_mut().bytes()?.to_vec();
                bytes
            }
        };
        self.state = BodyState::Materialized(bytes);
        Ok(())
    }

    /// The uncompressed payload, loading it on first access.
    pub fn bytes(&mut self) -> Result<&[u8]> {
        self.materialize()?;
        match &self.state {
            BodyState::Materialized(b) => Ok(b),
            _ => unreachable!(),
        }
    }

    /// Mutable payload access; forces materialization.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.materialize()?;
        match &mut self.state {
            BodyState::Materialized(b) => Ok(b),
            _ => unreachable!(),
        }
    }
}

// ── Block ────────────────────────────────────────────────────────────────────

/// One binary block tracked by the manager: a payload body plus the on-disk
/// bookkeeping needed to rewrite it (or avoid rewriting it) later.
pub struct Block {
    body: Handle,
    storage: ArrayStorage,
    /// Codec to apply on the next write.
    compression: Option<Compression>,
    /// Codec the on-disk payload currently uses.
    input_compression: Option<Compression>,
    /// On-disk offset of the block magic, once known.
    offset: Option<u64>,
    allocated_size: u64,
    used_size: u64,
    data_size: u64,
    checksum: [u8; CHECKSUM_SIZE],
    /// Ordinal among internal blocks; assigned during finalize and on read.
    source_index: Option<usize>,
    /// Distinct tree occurrences observed by the last finalize pass;
    /// zero until the block has been through one.
    occurrences: usize,
    /// Must this block's header + payload be written by the next
    /// random-access pass?
    dirty: bool,
    /// Compressed payload staged by the update planner for dirty blocks.
    staged: Option<Vec<u8>>,
    /// Resolved URI of the sibling file, for external blocks seen on read.
    external_uri: Option<String>,
}

impl Block {
    /// A fresh block for newly registered array data.
    pub fn new(body: Handle, storage: ArrayStorage) -> Self {
        let data_size = body.borrow().known_len().unwrap_or(0);
        Self {
            body,
            storage,
            compression: None,
            input_compression: None,
            offset: None,
            allocated_size: 0,
            used_size: 0,
            data_size,
            checksum: NO_CHECKSUM,
            source_index: None,
            occurrences: 0,
            dirty: true,
            staged: None,
            external_uri: None,
        }
    }

    /// A block attached from a decoded on-disk header.
    pub fn from_disk(header: &BlockHeader, body: Handle, offset: u64, source_index: usize) -> Self {
        Self {
            body,
            storage: ArrayStorage::Internal,
            compression: header.compression,
            input_compression: header.compression,
            offset: Some(offset),
            allocated_size: header.allocated_size,
            used_size: header.used_size,
            data_size: header.data_size,
            checksum: header.checksum,
            source_index: Some(source_index),
            occurrences: 0,
            dirty: false,
            staged: None,
            external_uri: None,
        }
    }

    pub fn handle(&self) -> Handle {
        Rc::clone(&self.body)
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.body) as usize
    }

    pub fn storage(&self) -> ArrayStorage {
        self.storage
    }

    pub(crate) fn set_storage(&mut self, storage: ArrayStorage) {
        self.storage = storage;
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub(crate) fn set_compression(&mut self, compression: Option<Compression>) {
        self.compression = compression;
    }

    pub(crate) fn input_compression(&self) -> Option<Compression> {
        self.input_compression
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn checksum(&self) -> [u8; CHECKSUM_SIZE] {
        self.checksum
    }

    pub fn source_index(&self) -> Option<usize> {
        self.source_index
    }

    pub(crate) fn set_source_index(&mut self, index: Option<usize>) {
        self.source_index = index;
    }

    /// Distinct tree occurrences recorded by the last finalize pass.
    pub fn occurrences(&self) -> usize {
        self.occurrences
    }

    pub(crate) fn set_occurrences(&mut self, count: usize) {
        self.occurrences = count;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn external_uri(&self) -> Option<&str> {
        self.external_uri.as_deref()
    }

    pub(crate) fn set_external_uri(&mut self, uri: String) {
        self.external_uri = Some(uri);
    }

    /// Full on-disk extent (magic through the end of the allocation).
    pub(crate) fn extent(&self) -> Option<(u64, u64)> {
        self.offset
            .map(|o| (o, o + crate::constants::BLOCK_OVERHEAD + self.allocated_size))
    }

    /// Stage this block for a rewrite at `offset` with the given payload.
    pub(crate) fn stage(
        &mut self,
        offset: u64,
        payload: Vec<u8>,
        data_size: u64,
        checksum: [u8; CHECKSUM_SIZE],
        allocated_size: u64,
    ) {
        self.offset = Some(offset);
        self.used_size = payload.len() as u64;
        self.data_size = data_size;
        self.checksum = checksum;
        self.allocated_size = allocated_size;
        self.staged = Some(payload);
        self.dirty = true;
    }

    pub(crate) fn take_staged(&mut self) -> Option<Vec<u8>> {
        self.staged.take()
    }

    pub(crate) fn header(&self) -> BlockHeader {
        BlockHeader {
            flags: 0,
            compression: self.compression,
            allocated_size: self.allocated_size,
            used_size: self.used_size,
            data_size: self.data_size,
            checksum: self.checksum,
        }
    }

    /// Record the outcome of a serial write of this block.
    pub(crate) fn record_write(
        &mut self,
        offset: u64,
        used_size: u64,
        data_size: u64,
        allocated_size: u64,
        checksum: [u8; CHECKSUM_SIZE],
    ) {
        self.offset = Some(offset);
        self.used_size = used_size;
        self.data_size = data_size;
        self.allocated_size = allocated_size;
        self.checksum = checksum;
        self.input_compression = self.compression;
        self.dirty = false;
        self.staged = None;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
        self.input_compression = self.compression;
        self.staged = None;
    }
}
