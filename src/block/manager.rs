//! The block manager: the bidirectional map between arrays and blocks.
//!
//! Arrays are keyed by the pointer identity of their payload handle, never
//! by value, so aliased views share one block and equal-looking data in
//! different buffers does not.  Blocks keep their discovery order: on the
//! write path that is registration order, on the read path the order the
//! block headers appear on disk.  Ordinal `source` indices are assigned to
//! internal blocks during [`BlockManager::finalize`] and are stable for
//! the duration of one write.

use std::collections::HashMap;

use crate::block::{checksum, ArrayStorage, Block, BlockBody, BlockHeader, Handle};
use crate::compression::{self, Compression};
use crate::constants::{BLOCK_MAGIC, NO_CHECKSUM};
use crate::error::{AsdfError, Result};
use crate::generic_io::{
    calculate_padding, external_uri, open_uri, read_exact, seek_until, GenericIo, Mode, Pad,
    SharedIo,
};
use crate::header::{write_version_line, Version};
use crate::ndarray::NdArray;
use crate::treeutil::iter_tree;
use crate::value::{Mapping, Value};

/// Lookup key accepted by [`BlockManager::get`].
pub enum BlockKey<'a> {
    Array(&'a NdArray),
    /// Ordinal index among internal blocks.
    Index(usize),
    /// Resolved URI of an external sibling file.
    Uri(&'a str),
}

/// Inverse of a lookup: where a block's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSource {
    Internal(usize),
    External(String),
    Inline(usize),
}

#[derive(Default)]
pub struct BlockManager {
    blocks: Vec<Block>,
    by_identity: HashMap<usize, usize>,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    pub(crate) fn block_mut(&mut self, index: usize) -> Option<&mut Block> {
        self.blocks.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    // ── Registration and lookup ──────────────────────────────────────────────

    /// Bind an array's payload handle to a block, creating a fresh
    /// internal block on first sight.  Returns the block's position.
    pub fn register(&mut self, handle: Handle) -> usize {
        let id = std::rc::Rc::as_ptr(&handle) as usize;
        if let Some(&index) = self.by_identity.get(&id) {
            return index;
        }
        let index = self.blocks.len();
        self.blocks.push(Block::new(handle, ArrayStorage::Internal));
        self.by_identity.insert(id, index);
        index
    }

    /// Register a handle whose data is stored inline.
    pub fn add_inline_block(&mut self, handle: Handle) -> usize {
        let index = self.register(handle);
        self.blocks[index].set_storage(ArrayStorage::Inline);
        index
    }

    /// Register a handle backed by an external sibling file.
    pub fn add_external_block(&mut self, handle: Handle, uri: String) -> usize {
        let index = self.register(handle);
        self.blocks[index].set_storage(ArrayStorage::External);
        self.blocks[index].set_external_uri(uri);
        index
    }

    pub fn index_of(&self, handle: &Handle) -> Option<usize> {
        self.by_identity
            .get(&(std::rc::Rc::as_ptr(handle) as usize))
            .copied()
    }

    /// Look a block up by array identity, internal ordinal, or source URI.
    pub fn get(&self, key: BlockKey<'_>) -> Result<&Block> {
        match key {
            BlockKey::Array(array) => self
                .index_of(array.handle())
                .and_then(|i| self.block(i))
                .ok_or_else(|| AsdfError::NotFound("array has no block".to_string())),
            BlockKey::Index(n) => self
                .internal_indices()
                .into_iter()
                .find(|&i| self.effective_source_index(i) == n)
                .and_then(|i| self.block(i))
                .ok_or_else(|| AsdfError::NotFound(format!("no block with source index {n}"))),
            BlockKey::Uri(uri) => self
                .blocks
                .iter()
                .find(|b| b.external_uri() == Some(uri))
                .ok_or_else(|| AsdfError::NotFound(format!("no external block for {uri}"))),
        }
    }

    /// Where the given block's data lives, as named in the tree.
    pub fn get_source(&self, index: usize) -> Result<BlockSource> {
        let block = self
            .block(index)
            .ok_or_else(|| AsdfError::NotFound(format!("no block {index}")))?;
        Ok(match block.storage() {
            ArrayStorage::Internal => BlockSource::Internal(self.effective_source_index(index)),
            ArrayStorage::External => BlockSource::External(
                block
                    .external_uri()
                    .map(str::to_string)
                    .unwrap_or_default(),
            ),
            ArrayStorage::Inline => BlockSource::Inline(
                self.inline_indices()
                    .into_iter()
                    .position(|i| i == index)
                    .unwrap_or(0),
            ),
        })
    }

    pub fn handle_for_source_index(&self, n: usize) -> Result<Handle> {
        self.internal_indices()
            .into_iter()
            .find(|&i| self.effective_source_index(i) == n)
            .map(|i| self.blocks[i].handle())
            .ok_or_else(|| AsdfError::NotFound(format!("block source {n} out of range")))
    }

    /// Ordinal of an internal block: the finalized index when assigned,
    /// the current position among internal blocks otherwise.
    pub fn effective_source_index(&self, index: usize) -> usize {
        if let Some(n) = self.blocks[index].source_index() {
            return n;
        }
        self.internal_indices()
            .into_iter()
            .position(|i| i == index)
            .unwrap_or(0)
    }

    pub fn external_ordinal(&self, index: usize) -> usize {
        self.external_indices()
            .into_iter()
            .position(|i| i == index)
            .unwrap_or(0)
    }

    pub(crate) fn internal_indices(&self) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|&i| self.blocks[i].storage() == ArrayStorage::Internal)
            .collect()
    }

    pub(crate) fn external_indices(&self) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|&i| self.blocks[i].storage() == ArrayStorage::External)
            .collect()
    }

    fn inline_indices(&self) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|&i| self.blocks[i].storage() == ArrayStorage::Inline)
            .collect()
    }

    pub fn internal_count(&self) -> usize {
        self.internal_indices().len()
    }

    // ── Storage and compression ──────────────────────────────────────────────

    /// Reclassify the block behind `handle`.  Views sharing the handle
    /// follow, since storage is a block-level property.
    ///
    /// Inline storage needs a source the text region can hold on its own:
    /// a buffer known to be aliased by several tree nodes is refused.
    pub fn set_storage(&mut self, handle: Handle, storage: ArrayStorage) -> Result<()> {
        let index = self.register(handle);
        if storage == ArrayStorage::Inline && self.blocks[index].occurrences() > 1 {
            return Err(AsdfError::CannotInline(
                "buffer is shared by several arrays in the tree".to_string(),
            ));
        }
        self.blocks[index].set_storage(storage);
        Ok(())
    }

    pub(crate) fn set_storage_unchecked(&mut self, index: usize, storage: ArrayStorage) {
        self.blocks[index].set_storage(storage);
    }

    pub fn get_storage(&mut self, handle: Handle) -> ArrayStorage {
        let index = self.register(handle);
        self.blocks[index].storage()
    }

    /// Set the write codec for the block behind `handle`.  When several
    /// views share the block, the last setter wins.
    pub fn set_compression(&mut self, handle: Handle, compression: Option<Compression>) {
        let index = self.register(handle);
        self.blocks[index].set_compression(compression);
    }

    pub fn get_compression(&mut self, handle: Handle) -> Option<Compression> {
        let index = self.register(handle);
        self.blocks[index].compression()
    }

    /// True when any internal block still has a known on-disk offset,
    /// i.e. came from (or was already written to) the associated file.
    pub fn has_blocks_with_offset(&self) -> bool {
        self.internal_indices()
            .into_iter()
            .any(|i| self.blocks[i].offset().is_some())
    }

    // ── Finalize ─────────────────────────────────────────────────────────────

    /// Prepare the block set for a write: register arrays reachable from
    /// the tree, apply blanket storage/compression overrides, reclassify
    /// small unshared arrays as inline when `auto_inline` is set, drop
    /// never-written blocks the tree no longer references, and assign
    /// final ordinal indices to internal blocks in first-seen order.
    pub fn finalize(
        &mut self,
        tree: &Mapping,
        all_storage: Option<ArrayStorage>,
        all_compression: Option<Option<Compression>>,
        auto_inline: Option<usize>,
    ) {
        // Occurrences per handle identity, and the element count of the
        // lone view when there is exactly one.
        let mut occurrences: HashMap<usize, (usize, usize)> = HashMap::new();
        let mut referenced: Vec<Handle> = Vec::new();
        for (_, value) in tree.iter() {
            iter_tree(value, &mut |node| {
                if let Value::Array(array) = node {
                    referenced.push(array.handle().clone());
                    let entry = occurrences.entry(array.identity()).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 = array.element_count();
                }
            });
        }
        for handle in referenced {
            self.register(handle);
        }

        // Drop unreferenced blocks that were never written.  Blocks that
        // already sit on disk are kept even when no array references them
        // any more: the reader walks the block stream sequentially, so a
        // removed block must keep occupying its extent and its ordinal
        // slot or every later source index would shift.
        let before = self.blocks.len();
        self.blocks
            .retain(|b| occurrences.contains_key(&b.identity()) || b.offset().is_some());
        if self.blocks.len() != before {
            log::debug!("finalize dropped {} unreferenced block(s)", before - self.blocks.len());
        }
        self.by_identity = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.identity(), i))
            .collect();

        for block in &mut self.blocks {
            if let Some(&(count, _)) = occurrences.get(&block.identity()) {
                block.set_occurrences(count);
            }
            if let Some(storage) = all_storage {
                block.set_storage(storage);
            }
            if let Some(compression) = all_compression {
                block.set_compression(compression);
            }
        }

        if let Some(threshold) = auto_inline {
            for block in &mut self.blocks {
                if block.storage() != ArrayStorage::Internal {
                    continue;
                }
                if let Some(&(count, elements)) = occurrences.get(&block.identity()) {
                    if count == 1 && elements < threshold {
                        block.set_storage(ArrayStorage::Inline);
                    }
                }
            }
        }

        let mut next = 0usize;
        for block in &mut self.blocks {
            if block.storage() == ArrayStorage::Internal {
                block.set_source_index(Some(next));
                next += 1;
            } else {
                block.set_source_index(None);
            }
        }
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Attach every internal block found from the current position.
    ///
    /// With `past_magic` the first block's magic has already been
    /// consumed.  Payloads stay on disk (lazy) on seekable streams unless
    /// `validate_checksums` forces them to be read and verified now.
    pub fn read_internal_blocks(
        &mut self,
        shared: &SharedIo,
        past_magic: bool,
        validate_checksums: bool,
    ) -> Result<()> {
        let mut first = past_magic;
        loop {
            let mut io_ref = shared.borrow_mut();
            let io: &mut dyn GenericIo = &mut **io_ref;

            if !first {
                let next = io.peek(4)?.to_vec();
                if next.len() < 4 {
                    break;
                }
                if next != BLOCK_MAGIC {
                    return Err(AsdfError::BadMagic { offset: io.tell()? });
                }
                io.consume(4)?;
            }
            first = false;

            let offset = io.tell()? - 4;
            let header = BlockHeader::read(io)?;
            let payload_offset = io.tell()?;
            let source_index = self.internal_count();

            let body = if io.seekable() && !validate_checksums {
                io.fast_forward(header.allocated_size)?;
                BlockBody::lazy_stream(
                    shared,
                    payload_offset,
                    header.used_size,
                    header.data_size,
                    header.compression,
                )
            } else {
                let mut raw = vec![0u8; header.used_size as usize];
                read_exact(io, &mut raw)?;
                let data =
                    compression::decompress(&raw, header.compression, header.data_size as usize)?;
                if validate_checksums && header.checksum != NO_CHECKSUM {
                    let digest = checksum(&data);
                    if digest != header.checksum {
                        return Err(AsdfError::ChecksumMismatch {
                            index: source_index,
                            expected: hex::encode(header.checksum),
                            actual: hex::encode(digest),
                        });
                    }
                }
                io.fast_forward(header.allocated_size.saturating_sub(header.used_size))?;
                BlockBody::materialized(data)
            };
            drop(io_ref);

            log::debug!(
                "block {source_index} at offset {offset}: {} byte(s), {}",
                header.data_size,
                header
                    .compression
                    .map(Compression::label)
                    .unwrap_or("uncompressed"),
            );

            let id = std::rc::Rc::as_ptr(&body) as usize;
            let index = self.blocks.len();
            self.blocks
                .push(Block::from_disk(&header, body, offset, source_index));
            self.by_identity.insert(id, index);
        }
        Ok(())
    }

    /// Scan to the first block magic, then attach all blocks.  Returns
    /// whether any binary region was found at all.
    pub fn read_blocks_after_yaml(
        &mut self,
        shared: &SharedIo,
        validate_checksums: bool,
    ) -> Result<bool> {
        let found = {
            let mut io_ref = shared.borrow_mut();
            let io: &mut dyn GenericIo = &mut **io_ref;
            seek_until(io, &BLOCK_MAGIC, true)?
        };
        if found {
            self.read_internal_blocks(shared, true, validate_checksums)?;
        }
        Ok(found)
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Force every payload that still lives in the host file's stream
    /// into memory.  Required before that stream is rewritten or
    /// truncated; payloads held by external sibling files stay lazy.
    pub fn materialize_stream_payloads(&mut self) -> Result<()> {
        for index in 0..self.blocks.len() {
            let handle = self.blocks[index].handle();
            if !handle.borrow().is_lazy_stream() {
                continue;
            }
            let mut body = handle.borrow_mut();
            body.bytes()?;
        }
        Ok(())
    }

    fn write_one_block(
        io: &mut dyn GenericIo,
        data: &[u8],
        target_compression: Option<Compression>,
        pad: Pad,
    ) -> Result<(u64, u64, u64, [u8; 16])> {
        let digest = checksum(data);
        let payload = compression::compress(data, target_compression)?;
        let padding = calculate_padding(payload.len() as u64, pad, io.block_size());
        let allocated = payload.len() as u64 + padding;
        let header = BlockHeader {
            flags: 0,
            compression: target_compression,
            allocated_size: allocated,
            used_size: payload.len() as u64,
            data_size: data.len() as u64,
            checksum: digest,
        };
        let offset = io.tell()?;
        header.write(io)?;
        io.write_all(&payload)?;
        if padding > 0 {
            io.write_all(&vec![0u8; padding as usize])?;
        }
        Ok((offset, payload.len() as u64, allocated, digest))
    }

    /// Write all internal blocks back to back at the current position.
    ///
    /// With `record_offsets` the blocks are rebound to their new on-disk
    /// locations; a copy to a foreign sink leaves them untouched.
    pub fn write_internal_blocks_serial(
        &mut self,
        io: &mut dyn GenericIo,
        pad: Pad,
        record_offsets: bool,
    ) -> Result<()> {
        for index in self.internal_indices() {
            let handle = self.blocks[index].handle();
            let data = handle.borrow_mut().bytes()?.to_vec();
            let target = self.blocks[index].compression();
            let (offset, used, allocated, digest) = Self::write_one_block(io, &data, target, pad)?;
            if record_offsets {
                self.blocks[index].record_write(offset, used, data.len() as u64, allocated, digest);
            }
        }
        Ok(())
    }

    /// Write the internal blocks staged by the update planner at their
    /// planned offsets.  Blocks that kept their extent are not touched,
    /// headers included.
    pub fn write_internal_blocks_random_access(&mut self, io: &mut dyn GenericIo) -> Result<()> {
        for index in self.internal_indices() {
            if !self.blocks[index].is_dirty() {
                continue;
            }
            let offset = self.blocks[index]
                .offset()
                .ok_or_else(|| AsdfError::io_invalid("dirty block without a planned offset"))?;
            let payload = match self.blocks[index].take_staged() {
                Some(p) => p,
                None => {
                    // Freshly registered block that skipped the planner.
                    let handle = self.blocks[index].handle();
                    let data = handle.borrow_mut().bytes()?.to_vec();
                    compression::compress(&data, self.blocks[index].compression())?
                }
            };
            let header = self.blocks[index].header();
            io.seek(offset)?;
            header.write(io)?;
            io.write_all(&payload)?;
            let padding = header.allocated_size - header.used_size;
            if padding > 0 {
                io.write_all(&vec![0u8; padding as usize])?;
            }
            self.blocks[index].mark_clean();
        }
        Ok(())
    }

    /// Write each external block into its own sibling ASDF file.
    pub fn write_external_blocks(
        &mut self,
        base_uri: Option<&str>,
        pad: Pad,
        version: Version,
    ) -> Result<()> {
        let externals = self.external_indices();
        if externals.is_empty() {
            return Ok(());
        }
        let base = base_uri.ok_or(AsdfError::NoBaseUri)?;
        for (ordinal, index) in externals.into_iter().enumerate() {
            let uri = external_uri(base, ordinal);
            let handle = self.blocks[index].handle();
            let data = handle.borrow_mut().bytes()?.to_vec();
            let target = self.blocks[index].compression();

            let mut io = open_uri(&uri, Mode::Write)?;
            write_version_line(io.as_mut(), version)?;
            Self::write_one_block(io.as_mut(), &data, target, pad)?;
            io.flush()?;

            self.blocks[index].set_external_uri(uri);
        }
        Ok(())
    }
}

#[cfg(test)]
impl BlockManager {
    /// Attach a pre-built block, as if it had been discovered on disk.
    pub(crate) fn attach_for_tests(&mut self, block: Block) {
        let id = block.identity();
        let index = self.blocks.len();
        self.blocks.push(block);
        self.by_identity.insert(id, index);
    }
}
