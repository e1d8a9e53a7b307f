//! The file engine.
//!
//! [`AsdfFile`] owns the stream, the tree, and the block manager, and
//! orchestrates the three ways content reaches disk:
//!
//! - **open**: version line, YAML region, lazy block discovery, reference
//!   marking, optional default fill, validation, tagged-tree conversion;
//! - **write_to**: serial copy to a new sink, leaving the engine's own
//!   stream and block bindings untouched;
//! - **update**: in-place rewrite of the associated file that reuses
//!   unchanged block extents where the layout planner allows, falling
//!   back to a serial rewrite plus truncation when it does not.
//!
//! The engine is single-threaded and synchronous; callers serialize
//! access.  Closing the engine releases the stream and every cached
//! external file; lazily loaded arrays become invalid (`NotOpen`) at that
//! point, while fully materialized ones keep working.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use crate::block::layout::calculate_updated_layout;
use crate::block::manager::BlockManager;
use crate::block::ArrayStorage;
use crate::compression::Compression;
use crate::constants::MAX_BLOCKS_DIGITS;
use crate::error::{AsdfError, Result};
use crate::extension::{ExtensionList, Hook, HookKind};
use crate::generic_io::{
    self, get_base_uri, path_to_uri, resolve_uri, GenericIo, Mode, Pad, SharedIo,
};
use crate::header::{
    read_token, read_version_line, read_yaml_region, write_version_line, HeaderToken, Version,
};
use crate::ndarray::NdArray;
use crate::reference::{self, resolve_pointer};
use crate::schema::{run_validator, DefaultsStrategy, SchemaCache};
use crate::treeutil::{iter_tree, walk_and_modify};
use crate::value::{Mapping, Value};
use crate::yamlutil::{custom_to_tagged, dump_tree, load_tree, tagged_to_custom, ReadContext};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OpenOptions {
    pub mode: Mode,
    /// Overrides the URI derived from the stream, when given.
    pub uri: Option<String>,
    /// Read every payload up front and verify its digest.
    pub validate_checksums: bool,
    /// Insert schema defaults into the tree while reading.
    pub fill_defaults: bool,
    pub extensions: Option<Rc<ExtensionList>>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Read,
            uri: None,
            validate_checksums: false,
            fill_defaults: true,
            extensions: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct WriteOptions {
    /// Blanket storage override applied to every block before writing.
    pub all_array_storage: Option<ArrayStorage>,
    /// Blanket codec override; `Some(None)` forces no compression.
    pub all_array_compression: Option<Option<Compression>>,
    /// Store unshared arrays with fewer elements than this inline.
    pub auto_inline: Option<usize>,
    pub pad_blocks: Pad,
    /// Strip properties equal to their schema defaults from the YAML.
    pub remove_defaults: bool,
}

// ── External cache ───────────────────────────────────────────────────────────

/// Deduplicates externally referenced ASDF files by resolved base URI.
/// Entries share the host engine's lifecycle and close with it.
pub struct ExternalCache {
    by_uri: HashMap<String, Rc<RefCell<AsdfFile>>>,
    extensions: Rc<ExtensionList>,
    validate_checksums: bool,
    fill_defaults: bool,
}

impl ExternalCache {
    fn new(extensions: Rc<ExtensionList>, validate_checksums: bool, fill_defaults: bool) -> Self {
        Self {
            by_uri: HashMap::new(),
            extensions,
            validate_checksums,
            fill_defaults,
        }
    }

    /// Load (or return the cached) external file at an already-resolved,
    /// fragment-free URI.
    pub fn load(&mut self, uri: &str) -> Result<Rc<RefCell<AsdfFile>>> {
        if let Some(file) = self.by_uri.get(uri) {
            return Ok(Rc::clone(file));
        }
        log::debug!("opening external file {uri}");
        let file = AsdfFile::open_uri(
            uri,
            OpenOptions {
                mode: Mode::Read,
                uri: Some(uri.to_string()),
                validate_checksums: self.validate_checksums,
                fill_defaults: self.fill_defaults,
                extensions: Some(Rc::clone(&self.extensions)),
            },
        )?;
        let file = Rc::new(RefCell::new(file));
        self.by_uri.insert(uri.to_string(), Rc::clone(&file));
        Ok(file)
    }

    pub fn len(&self) -> usize {
        self.by_uri.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uri.is_empty()
    }

    fn close(&mut self) {
        for (_, file) in self.by_uri.drain() {
            file.borrow_mut().close();
        }
    }
}

/// What an external URI resolves to.
pub enum ExternalTarget {
    /// The URI points back at the host file itself.
    SelfFile,
    File(Rc<RefCell<AsdfFile>>),
}

// ── AsdfFile ─────────────────────────────────────────────────────────────────

pub struct AsdfFile {
    stream: Option<SharedIo>,
    uri: Option<String>,
    version: Version,
    tree: Mapping,
    blocks: BlockManager,
    extensions: Rc<ExtensionList>,
    externals: Rc<RefCell<ExternalCache>>,
    schemas: SchemaCache,
}

impl Default for AsdfFile {
    fn default() -> Self {
        Self::new()
    }
}

impl AsdfFile {
    // ── Construction ─────────────────────────────────────────────────────────

    pub fn new() -> Self {
        Self::with_extensions(Rc::new(ExtensionList::builtin()))
    }

    pub fn with_extensions(extensions: Rc<ExtensionList>) -> Self {
        let externals = Rc::new(RefCell::new(ExternalCache::new(
            Rc::clone(&extensions),
            false,
            true,
        )));
        Self {
            stream: None,
            uri: None,
            version: Version::DEFAULT,
            tree: Mapping::new(),
            blocks: BlockManager::new(),
            extensions,
            externals,
            schemas: SchemaCache::new(),
        }
    }

    /// Build an engine around a tree, validating it.
    pub fn from_tree(tree: Mapping) -> Result<Self> {
        let mut file = Self::new();
        file.set_tree(tree)?;
        file.find_references();
        Ok(file)
    }

    /// Adopt another engine's tree.  Arrays are shared, blocks are not:
    /// the new engine binds its own block set to the same buffers.
    pub fn from_file(other: &AsdfFile) -> Result<Self> {
        let mut file = Self::with_extensions(Rc::clone(&other.extensions));
        file.uri = other.uri.clone();
        file.tree = other.tree.clone();
        file.run_modifying_hook(HookKind::CopyToNewAsdf, false)?;
        file.find_references();
        // Register the adopted arrays so storage queries work at once.
        let tree = std::mem::take(&mut file.tree);
        for (_, value) in tree.iter() {
            iter_tree(value, &mut |node| {
                if let Value::Array(array) = node {
                    file.blocks.register(array.handle().clone());
                }
            });
        }
        file.tree = tree;
        Ok(file)
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    pub fn open_path(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let uri = path_to_uri(path.as_ref())?;
        Self::open_uri(&uri, options)
    }

    pub fn open_uri(uri: &str, options: OpenOptions) -> Result<Self> {
        let io = generic_io::open_uri(uri, options.mode)?;
        Self::open_stream(io, options)
    }

    pub fn open_bytes(data: Vec<u8>, options: OpenOptions) -> Result<Self> {
        let io = generic_io::MemoryIo::from_vec(data, options.mode);
        Self::open_stream(Box::new(io), options)
    }

    pub fn open_stream(io: Box<dyn GenericIo>, options: OpenOptions) -> Result<Self> {
        let extensions = options
            .extensions
            .unwrap_or_else(|| Rc::new(ExtensionList::builtin()));
        let mut file = Self::with_extensions(Rc::clone(&extensions));
        file.externals = Rc::new(RefCell::new(ExternalCache::new(
            extensions,
            options.validate_checksums,
            options.fill_defaults,
        )));
        file.uri = options.uri.or_else(|| io.uri().map(str::to_string));

        let shared: SharedIo = Rc::new(RefCell::new(io));
        file.stream = Some(Rc::clone(&shared));

        let mut region = Vec::new();
        let mut past_magic = false;
        {
            let mut io_ref = shared.borrow_mut();
            let io: &mut dyn GenericIo = &mut **io_ref;
            file.version = read_version_line(io)?;
            match read_token(io)? {
                HeaderToken::Yaml => region = read_yaml_region(io)?,
                HeaderToken::Block => past_magic = true,
                HeaderToken::Eof => {}
            }
        }

        if past_magic {
            file.blocks
                .read_internal_blocks(&shared, true, options.validate_checksums)?;
        } else if !region.is_empty() {
            file.blocks
                .read_blocks_after_yaml(&shared, options.validate_checksums)?;
        }

        let mut tagged = load_tree(&region)?;
        if options.fill_defaults {
            run_validator(
                &mut tagged,
                &file.extensions,
                &mut file.schemas,
                DefaultsStrategy::Fill,
            )?;
        }
        run_validator(
            &mut tagged,
            &file.extensions,
            &mut file.schemas,
            DefaultsStrategy::Ignore,
        )?;

        let custom = {
            let mut ctx = ReadContext {
                blocks: &mut file.blocks,
                externals: &file.externals,
                uri: file.uri.clone(),
            };
            tagged_to_custom(&tagged, &mut ctx)?
        };
        file.tree = match custom {
            Value::Map(map) => map,
            Value::Null => Mapping::new(),
            _ => return Err(AsdfError::io_invalid("top-level YAML node is not a mapping")),
        };

        file.run_hook(HookKind::PostRead);
        Ok(file)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn tree(&self) -> &Mapping {
        &self.tree
    }

    /// Direct tree mutation between open and update.
    pub fn tree_mut(&mut self) -> &mut Mapping {
        &mut self.tree
    }

    /// Replace the tree, validating the new one first.  The engine's
    /// state is untouched when validation fails.
    pub fn set_tree(&mut self, tree: Mapping) -> Result<()> {
        let uri = self.uri.clone();
        let mut tagged = custom_to_tagged(&tree, &mut self.blocks, uri.as_deref())?;
        run_validator(
            &mut tagged,
            &self.extensions,
            &mut self.schemas,
            DefaultsStrategy::Ignore,
        )?;
        self.tree = tree;
        Ok(())
    }

    /// Validate the current tree against the schemas its tags name.
    pub fn validate(&mut self) -> Result<()> {
        let uri = self.uri.clone();
        let mut tagged = custom_to_tagged(&self.tree, &mut self.blocks, uri.as_deref())?;
        run_validator(
            &mut tagged,
            &self.extensions,
            &mut self.schemas,
            DefaultsStrategy::Ignore,
        )
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn blocks(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn external_cache(&self) -> &Rc<RefCell<ExternalCache>> {
        &self.externals
    }

    // ── Array storage and compression ────────────────────────────────────────

    pub fn set_array_storage(&mut self, array: &NdArray, storage: ArrayStorage) -> Result<()> {
        self.blocks.set_storage(array.handle().clone(), storage)
    }

    pub fn get_array_storage(&mut self, array: &NdArray) -> ArrayStorage {
        self.blocks.get_storage(array.handle().clone())
    }

    /// Set the write codec for an array's block.  Views sharing the block
    /// follow; when several set different codecs the last one wins.
    pub fn set_array_compression(&mut self, array: &NdArray, compression: Option<Compression>) {
        self.blocks
            .set_compression(array.handle().clone(), compression)
    }

    pub fn get_array_compression(&mut self, array: &NdArray) -> Option<Compression> {
        self.blocks.get_compression(array.handle().clone())
    }

    // ── References ───────────────────────────────────────────────────────────

    /// Convert every `{$ref: ...}` mapping in the tree into a reference
    /// node, without loading anything.
    pub fn find_references(&mut self) {
        let tree = std::mem::take(&mut self.tree);
        self.tree = match reference::find_references(Value::Map(tree)) {
            Value::Map(map) => map,
            _ => Mapping::new(),
        };
    }

    /// Load every reference target and place it directly in the tree.
    /// Cyclic references are left unresolved rather than recursed into.
    pub fn resolve_references(&mut self) -> Result<()> {
        let snapshot = Value::Map(self.tree.clone());
        let tree = std::mem::take(&mut self.tree);
        let mut seen = HashSet::new();
        let resolved = self.resolve_node(Value::Map(tree), &snapshot, &mut seen)?;
        match resolved {
            Value::Map(map) => self.set_tree(map),
            _ => Err(AsdfError::io_invalid("tree root vanished during resolution")),
        }
    }

    fn resolve_node(
        &mut self,
        value: Value,
        root: &Value,
        seen: &mut HashSet<(String, String)>,
    ) -> Result<Value> {
        Ok(match value {
            Value::Ref(reference) => {
                let base = resolve_uri(self.uri.as_deref(), reference.base());
                let fragment = reference.fragment().to_string();
                let key = (base.clone(), fragment.clone());
                if !seen.insert(key.clone()) {
                    log::warn!("reference cycle through {}, leaving unresolved", reference.uri);
                    return Ok(Value::Ref(reference));
                }
                let is_self =
                    reference.base().is_empty() || self.uri.as_deref() == Some(base.as_str());
                let target = if is_self {
                    resolve_pointer(root, &fragment)?.clone()
                } else {
                    let external = self.externals.borrow_mut().load(&base)?;
                    let tree = Value::Map(external.borrow().tree.clone());
                    resolve_pointer(&tree, &fragment)?.clone()
                };
                let resolved = self.resolve_node(target, root, seen)?;
                seen.remove(&key);
                resolved
            }
            Value::Seq(items) => Value::Seq(
                items
                    .into_iter()
                    .map(|item| self.resolve_node(item, root, seen))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.into_entries()
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.resolve_node(v, root, seen)?)))
                    .collect::<Result<Mapping>>()?,
            ),
            other => other,
        })
    }

    /// Resolve an external URI through the cache, short-circuiting
    /// references back to this file.
    pub fn open_external(&mut self, uri: &str) -> Result<ExternalTarget> {
        let resolved = resolve_uri(self.uri.as_deref(), get_base_uri(uri));
        if resolved.is_empty() || self.uri.as_deref() == Some(resolved.as_str()) {
            return Ok(ExternalTarget::SelfFile);
        }
        Ok(ExternalTarget::File(
            self.externals.borrow_mut().load(&resolved)?,
        ))
    }

    /// Resolve every reference, then mark all blocks inline so a
    /// subsequent write produces a pure-YAML, self-contained file.
    pub fn resolve_and_inline(&mut self) -> Result<()> {
        self.resolve_references()?;
        self.blocks.materialize_stream_payloads()?;
        for index in 0..self.blocks.len() {
            self.blocks.set_storage_unchecked(index, ArrayStorage::Inline);
        }
        Ok(())
    }

    // ── Schema defaults ──────────────────────────────────────────────────────

    pub fn fill_defaults(&mut self) -> Result<()> {
        self.rewrite_defaults(DefaultsStrategy::Fill)
    }

    pub fn remove_defaults(&mut self) -> Result<()> {
        self.rewrite_defaults(DefaultsStrategy::Remove)
    }

    fn rewrite_defaults(&mut self, strategy: DefaultsStrategy) -> Result<()> {
        let uri = self.uri.clone();
        let mut tagged = custom_to_tagged(&self.tree, &mut self.blocks, uri.as_deref())?;
        run_validator(&mut tagged, &self.extensions, &mut self.schemas, strategy)?;
        let custom = {
            let mut ctx = ReadContext {
                blocks: &mut self.blocks,
                externals: &self.externals,
                uri: self.uri.clone(),
            };
            tagged_to_custom(&tagged, &mut ctx)?
        };
        self.tree = match custom {
            Value::Map(map) => map,
            _ => Mapping::new(),
        };
        Ok(())
    }

    // ── Hooks ────────────────────────────────────────────────────────────────

    /// Run an observing hook over every array node in the tree.
    pub fn run_hook(&mut self, kind: HookKind) {
        if !self.extensions.has_hooks(kind) {
            return;
        }
        let extensions = Rc::clone(&self.extensions);
        for (_, value) in self.tree.iter() {
            iter_tree(value, &mut |node| {
                if let Value::Array(_) = node {
                    if let Some(Hook::Observe(hook)) =
                        extensions.hook(crate::constants::NDARRAY_TAG, kind)
                    {
                        hook(node);
                    }
                }
            });
        }
    }

    /// Run a modifying hook; returned replacement nodes are spliced into
    /// the tree bottom-up.
    pub fn run_modifying_hook(&mut self, kind: HookKind, validate: bool) -> Result<()> {
        if !self.extensions.has_hooks(kind) {
            return Ok(());
        }
        let extensions = Rc::clone(&self.extensions);
        let tree = std::mem::take(&mut self.tree);
        let rebuilt = walk_and_modify(Value::Map(tree), &mut |node| {
            if let Value::Array(_) = &node {
                if let Some(Hook::Modify(hook)) =
                    extensions.hook(crate::constants::NDARRAY_TAG, kind)
                {
                    return hook(node);
                }
            }
            node
        });
        let map = match rebuilt {
            Value::Map(map) => map,
            _ => Mapping::new(),
        };
        if validate {
            self.set_tree(map)
        } else {
            self.tree = map;
            Ok(())
        }
    }

    // ── Copy and close ───────────────────────────────────────────────────────

    /// Deep-copy the tree into a new engine sharing this one's extension
    /// set.  The copy has no stream and no blocks bound to this file.
    pub fn copy(&self) -> Result<AsdfFile> {
        fn deep(value: &Value) -> Result<Value> {
            Ok(match value {
                Value::Array(array) => Value::Array(array.deep_copy()?),
                Value::Seq(items) => {
                    Value::Seq(items.iter().map(deep).collect::<Result<Vec<_>>>()?)
                }
                Value::Map(map) => Value::Map(
                    map.iter()
                        .map(|(k, v)| Ok((k.to_string(), deep(v)?)))
                        .collect::<Result<Mapping>>()?,
                ),
                other => other.clone(),
            })
        }

        let mut tree = Mapping::new();
        for (key, value) in self.tree.iter() {
            tree.insert(key, deep(value)?);
        }
        let mut copy = AsdfFile::with_extensions(Rc::clone(&self.extensions));
        copy.uri = self.uri.clone();
        copy.set_tree(tree)?;
        copy.find_references();
        Ok(copy)
    }

    /// Release the stream and every cached external file.  Lazy arrays
    /// into released blocks become invalid.
    pub fn close(&mut self) {
        self.stream = None;
        self.externals.borrow_mut().close();
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    pub fn write_to_path(&mut self, path: impl AsRef<Path>, options: &WriteOptions) -> Result<()> {
        let uri = path_to_uri(path.as_ref())?;
        if self.uri.as_deref() == Some(uri.as_str()) {
            // Writing over the file we lazily read from: load payloads
            // before the destination open truncates them away.
            self.blocks.materialize_stream_payloads()?;
        }
        let mut io = generic_io::open_uri(&uri, Mode::Write)?;
        self.write_impl(io.as_mut(), Some(&uri), options, false)
    }

    /// Copy the file to `io`.  The engine's own stream, block offsets,
    /// and lazy bindings are left untouched.
    pub fn write_to_stream(&mut self, io: &mut dyn GenericIo, options: &WriteOptions) -> Result<()> {
        let uri = io.uri().map(str::to_string);
        self.write_impl(io, uri.as_deref(), options, false)
    }

    fn pre_write(&mut self, options: &WriteOptions) {
        if !self.tree.is_empty() {
            self.run_hook(HookKind::PreWrite);
        }
        self.blocks.finalize(
            &self.tree,
            options.all_array_storage,
            options.all_array_compression,
            options.auto_inline,
        );
    }

    fn post_write(&mut self) {
        if !self.tree.is_empty() {
            self.run_hook(HookKind::PostWrite);
        }
    }

    fn write_impl(
        &mut self,
        io: &mut dyn GenericIo,
        dst_uri: Option<&str>,
        options: &WriteOptions,
        record_offsets: bool,
    ) -> Result<()> {
        self.pre_write(options);
        let result = (|| {
            self.write_tree_region(io, dst_uri, options)?;
            self.blocks
                .write_internal_blocks_serial(io, options.pad_blocks, record_offsets)?;
            self.blocks
                .write_external_blocks(dst_uri, options.pad_blocks, self.version)?;
            io.flush()
        })();
        self.post_write();
        result
    }

    /// Version line plus the YAML region (when the tree is non-empty),
    /// padded when block padding is on.
    fn write_tree_region(
        &mut self,
        io: &mut dyn GenericIo,
        dst_uri: Option<&str>,
        options: &WriteOptions,
    ) -> Result<()> {
        write_version_line(io, self.version)?;
        if self.tree.is_empty() {
            return Ok(());
        }
        let region = self.serialize_region(dst_uri, options)?;
        io.write_all(&region)?;
        if options.pad_blocks != Pad::None {
            let padding = generic_io::calculate_padding(
                io.tell()?,
                options.pad_blocks,
                io.block_size(),
            );
            if padding > 0 {
                io.write_all(&vec![0u8; padding as usize])?;
            }
        }
        Ok(())
    }

    fn serialize_region(
        &mut self,
        dst_uri: Option<&str>,
        options: &WriteOptions,
    ) -> Result<Vec<u8>> {
        let mut tagged = custom_to_tagged(&self.tree, &mut self.blocks, dst_uri)?;
        if options.remove_defaults {
            run_validator(
                &mut tagged,
                &self.extensions,
                &mut self.schemas,
                DefaultsStrategy::Remove,
            )?;
        }
        dump_tree(&tagged)
    }

    // ── Update ───────────────────────────────────────────────────────────────

    /// Rewrite the associated file in place.
    ///
    /// Requires an open, writable handle.  On a non-seekable stream this
    /// is the first point that reports `NotSeekable`.  When every block
    /// is pushed external the in-place machinery gains nothing, so the
    /// file is simply rewritten serially and truncated.
    pub fn update(&mut self, options: &WriteOptions) -> Result<()> {
        let shared = match &self.stream {
            Some(shared) => Rc::clone(shared),
            None => return Err(AsdfError::NotOpen),
        };
        if !shared.borrow().writable() {
            return Err(AsdfError::NotWritable);
        }

        if options.all_array_storage == Some(ArrayStorage::External) {
            self.pre_write(options);
            let result = self.serial_rewrite(&shared, options);
            self.post_write();
            return result;
        }

        if !shared.borrow().seekable() {
            return Err(AsdfError::NotSeekable);
        }

        self.pre_write(options);
        let result = self.update_impl(&shared, options);
        self.post_write();
        result
    }

    fn update_impl(&mut self, shared: &SharedIo, options: &WriteOptions) -> Result<()> {
        if !self.blocks.has_blocks_with_offset() {
            // Nothing on disk worth reusing.
            return self.serial_rewrite(shared, options);
        }

        let uri = self.uri.clone();
        let region = self.serialize_region(uri.as_deref(), options)?;
        let version_line_len = format!("#ASDF {}\n", self.version).len() as u64;
        let budget = version_line_len
            + region.len() as u64
            + (self.internal_ref_count() * MAX_BLOCKS_DIGITS) as u64;

        let block_size = shared.borrow().block_size();
        let plan = calculate_updated_layout(
            &mut self.blocks,
            budget,
            options.pad_blocks,
            block_size,
        )?;

        let Some(final_size) = plan else {
            log::warn!("no block layout could be reused, rewriting serially");
            return self.serial_rewrite(shared, options);
        };

        {
            let mut io_ref = shared.borrow_mut();
            let io: &mut dyn GenericIo = &mut **io_ref;
            io.seek(0)?;
            write_version_line(io, self.version)?;
            io.write_all(&region)?;
            let pos = io.tell()?;
            if pos < budget {
                // Pad the text region out to the size the plan assumed.
                io.write_all(&vec![0u8; (budget - pos) as usize])?;
            }
            self.blocks.write_internal_blocks_random_access(io)?;
            io.flush()?;
            io.truncate(final_size)?;
        }

        self.blocks
            .write_external_blocks(uri.as_deref(), options.pad_blocks, self.version)?;
        Ok(())
    }

    /// Full rewrite of the associated stream from offset zero, then
    /// truncation to the written length.
    fn serial_rewrite(&mut self, shared: &SharedIo, options: &WriteOptions) -> Result<()> {
        // Payloads may still live in the very stream about to be
        // overwritten; load them first.
        self.blocks.materialize_stream_payloads()?;
        let uri = self.uri.clone();
        {
            let mut io_ref = shared.borrow_mut();
            let io: &mut dyn GenericIo = &mut **io_ref;
            io.seek(0)?;
            self.write_tree_region(io, uri.as_deref(), options)?;
            self.blocks
                .write_internal_blocks_serial(io, options.pad_blocks, true)?;
            let end = io.tell()?;
            io.flush()?;
            io.truncate(end)?;
        }
        self.blocks
            .write_external_blocks(uri.as_deref(), options.pad_blocks, self.version)?;
        Ok(())
    }

    fn internal_ref_count(&self) -> usize {
        let mut count = 0;
        for (_, value) in self.tree.iter() {
            iter_tree(value, &mut |node| {
                if let Value::Array(array) = node {
                    if let Some(index) = self.blocks.index_of(array.handle()) {
                        if self.blocks.block(index).unwrap().storage() == ArrayStorage::Internal {
                            count += 1;
                        }
                    }
                }
            });
        }
        count
    }
}
