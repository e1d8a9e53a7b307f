//! The tagged-tree bridge.
//!
//! Two directions: [`custom_to_tagged`] turns the domain tree into a
//! `serde_yaml` value tree whose `ndarray` nodes carry a `source` linking
//! them to blocks (by ordinal index, external sibling name, or inline
//! data), and [`tagged_to_custom`] inverts that, binding array views back
//! onto block payload handles.  Both are full walks and preserve mapping
//! order.
//!
//! The YAML region itself is framed here too: a `%YAML 1.1` directive, the
//! `%TAG !` shorthand declaration, a `--- !core/asdf` document start, the
//! serialized body, and the `...` end marker.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping as YamlMapping, Number, Value as Yaml};

use crate::asdf::ExternalCache;
use crate::block::manager::BlockManager;
use crate::block::{ArrayStorage, BlockBody};
use crate::constants::{ASDF_TAG, NDARRAY_TAG, TAG_PREFIX};
use crate::error::{AsdfError, Result};
use crate::generic_io::{external_name, get_base_uri, resolve_uri};
use crate::ndarray::{Dtype, Endian, NdArray};
use crate::value::{Mapping, Value};

// ── serde_yaml helpers ───────────────────────────────────────────────────────

pub(crate) fn yaml_get<'a>(map: &'a YamlMapping, key: &str) -> Option<&'a Yaml> {
    map.get(&Yaml::String(key.to_string()))
}

pub(crate) fn yaml_get_mut<'a>(map: &'a mut YamlMapping, key: &str) -> Option<&'a mut Yaml> {
    map.get_mut(&Yaml::String(key.to_string()))
}

pub(crate) fn yaml_remove(map: &mut YamlMapping, key: &str) -> Option<Yaml> {
    map.remove(&Yaml::String(key.to_string()))
}

/// Tag text without the `!` marker the display form carries.
pub(crate) fn tag_str(tag: &Tag) -> String {
    tag.to_string().trim_start_matches('!').to_string()
}

/// Does `tag` name the given short tag, in either short or fully
/// resolved form?
pub(crate) fn tag_matches(tag: &str, short: &str) -> bool {
    tag == short || tag.ends_with(&format!("/{short}")) && tag.starts_with("tag:")
}

// ── Region framing ───────────────────────────────────────────────────────────

/// Parse a YAML region (directives and markers included) into a value tree.
pub fn load_tree(region: &[u8]) -> Result<Yaml> {
    if region.is_empty() {
        return Ok(Yaml::Null);
    }
    let text = std::str::from_utf8(region)
        .map_err(|_| AsdfError::io_invalid("YAML region is not UTF-8"))?;
    Ok(serde_yaml::from_str(text)?)
}

/// Serialize a tagged body into a complete YAML region.
pub fn dump_tree(body: &Yaml) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(b"%YAML 1.1\n");
    out.extend_from_slice(format!("%TAG ! {TAG_PREFIX}\n").as_bytes());
    out.extend_from_slice(format!("--- !{ASDF_TAG}\n").as_bytes());
    let text = serde_yaml::to_string(body)?;
    out.extend_from_slice(text.as_bytes());
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(b"...\n");
    Ok(out)
}

// ── custom → tagged ──────────────────────────────────────────────────────────

/// Convert the domain tree to a tagged tree, registering every array with
/// the block manager on the way.
///
/// `external_base` is the destination URI; it is only needed (and only
/// demanded) when an external-storage array is encountered.
pub fn custom_to_tagged(
    tree: &Mapping,
    blocks: &mut BlockManager,
    external_base: Option<&str>,
) -> Result<Yaml> {
    let mut out = YamlMapping::new();
    for (key, value) in tree.iter() {
        out.insert(
            Yaml::String(key.to_string()),
            value_to_tagged(value, blocks, external_base)?,
        );
    }
    Ok(Yaml::Mapping(out))
}

fn value_to_tagged(
    value: &Value,
    blocks: &mut BlockManager,
    external_base: Option<&str>,
) -> Result<Yaml> {
    Ok(match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Bool(*b),
        Value::Int(i) => Yaml::Number(Number::from(*i)),
        Value::Float(f) => Yaml::Number(Number::from(*f)),
        Value::Str(s) => Yaml::String(s.clone()),
        Value::Seq(items) => Yaml::Sequence(
            items
                .iter()
                .map(|v| value_to_tagged(v, blocks, external_base))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Map(map) => {
            let mut out = YamlMapping::new();
            for (k, v) in map.iter() {
                out.insert(
                    Yaml::String(k.to_string()),
                    value_to_tagged(v, blocks, external_base)?,
                );
            }
            Yaml::Mapping(out)
        }
        Value::Ref(r) => {
            let mut out = YamlMapping::new();
            out.insert(
                Yaml::String("$ref".to_string()),
                Yaml::String(r.uri.clone()),
            );
            Yaml::Mapping(out)
        }
        Value::Array(array) => ndarray_to_tagged(array, blocks, external_base)?,
    })
}

fn ndarray_to_tagged(
    array: &NdArray,
    blocks: &mut BlockManager,
    external_base: Option<&str>,
) -> Result<Yaml> {
    let index = blocks.register(array.handle().clone());
    let storage = blocks.block(index).expect("registered block").storage();

    let mut node = YamlMapping::new();
    match storage {
        ArrayStorage::Internal => {
            let source = blocks.effective_source_index(index);
            node.insert(
                Yaml::String("source".to_string()),
                Yaml::Number(Number::from(source as u64)),
            );
        }
        ArrayStorage::External => {
            let base = external_base.ok_or(AsdfError::NoBaseUri)?;
            let ordinal = blocks.external_ordinal(index);
            node.insert(
                Yaml::String("source".to_string()),
                Yaml::String(external_name(base, ordinal)),
            );
        }
        ArrayStorage::Inline => {
            node.insert(
                Yaml::String("data".to_string()),
                inline_data_value(array)?,
            );
        }
    }

    node.insert(
        Yaml::String("datatype".to_string()),
        Yaml::String(array.dtype().name().to_string()),
    );
    node.insert(
        Yaml::String("shape".to_string()),
        Yaml::Sequence(
            array
                .shape()
                .iter()
                .map(|&n| Yaml::Number(Number::from(n as u64)))
                .collect(),
        ),
    );

    if storage != ArrayStorage::Inline {
        node.insert(
            Yaml::String("byteorder".to_string()),
            Yaml::String(array.byteorder().name().to_string()),
        );
        if array.byte_offset() != 0 {
            node.insert(
                Yaml::String("offset".to_string()),
                Yaml::Number(Number::from(array.byte_offset() as u64)),
            );
        }
        if !array.is_contiguous() {
            if let Some(strides) = array.strides() {
                node.insert(
                    Yaml::String("strides".to_string()),
                    Yaml::Sequence(
                        strides
                            .iter()
                            .map(|&s| Yaml::Number(Number::from(s as u64)))
                            .collect(),
                    ),
                );
            }
        }
    }

    Ok(Yaml::Tagged(Box::new(TaggedValue {
        tag: Tag::new(NDARRAY_TAG),
        value: Yaml::Mapping(node),
    })))
}

/// Nested sequence of element values, shaped like the array.
fn inline_data_value(array: &NdArray) -> Result<Yaml> {
    let dtype = array.dtype();
    let mut flat: Vec<Yaml> = Vec::with_capacity(array.element_count());
    if dtype.is_float() {
        for v in array.to_vec_f64()? {
            flat.push(Yaml::Number(Number::from(v)));
        }
    } else {
        for v in array.to_vec_i64()? {
            flat.push(Yaml::Number(Number::from(v)));
        }
    }
    let mut iter = flat.into_iter();
    Ok(nest_values(array.shape(), &mut iter))
}

fn nest_values(shape: &[usize], flat: &mut impl Iterator<Item = Yaml>) -> Yaml {
    match shape.split_first() {
        None => flat.next().unwrap_or(Yaml::Null),
        Some((&n, rest)) => {
            Yaml::Sequence((0..n).map(|_| nest_values(rest, flat)).collect())
        }
    }
}

// ── tagged → custom ──────────────────────────────────────────────────────────

/// Context for rebinding array nodes while reading a file.
pub struct ReadContext<'a> {
    pub blocks: &'a mut BlockManager,
    pub externals: &'a Rc<RefCell<ExternalCache>>,
    /// URI of the host file, for resolving external sources.
    pub uri: Option<String>,
}

/// Convert a tagged tree back into the domain tree, binding `ndarray`
/// nodes to blocks.  The top-level document tag is unwrapped here.
pub fn tagged_to_custom(node: &Yaml, ctx: &mut ReadContext<'_>) -> Result<Value> {
    Ok(match node {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(*b),
        Yaml::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Yaml::String(s) => Value::Str(s.clone()),
        Yaml::Sequence(items) => Value::Seq(
            items
                .iter()
                .map(|item| tagged_to_custom(item, ctx))
                .collect::<Result<Vec<_>>>()?,
        ),
        Yaml::Mapping(map) => {
            if map.len() == 1 {
                if let Some(uri) = yaml_get(map, "$ref").and_then(Yaml::as_str) {
                    return Ok(Value::Ref(crate::reference::Reference::new(uri)));
                }
            }
            let mut out = Mapping::new();
            for (k, v) in map {
                out.insert(yaml_key_string(k), tagged_to_custom(v, ctx)?);
            }
            Value::Map(out)
        }
        Yaml::Tagged(tagged) => {
            let tag = tag_str(&tagged.tag);
            if tag_matches(&tag, NDARRAY_TAG) {
                ndarray_from_tagged(&tagged.value, ctx)?
            } else {
                // Unknown or structural tags keep their content.
                if !tag_matches(&tag, ASDF_TAG) {
                    log::debug!("no converter for tag {tag}, keeping raw structure");
                }
                tagged_to_custom(&tagged.value, ctx)?
            }
        }
    })
}

fn yaml_key_string(key: &Yaml) -> String {
    match key {
        Yaml::String(s) => s.clone(),
        Yaml::Number(n) => n.to_string(),
        Yaml::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn ndarray_from_tagged(node: &Yaml, ctx: &mut ReadContext<'_>) -> Result<Value> {
    let map = node
        .as_mapping()
        .ok_or_else(|| AsdfError::BadType("ndarray node is not a mapping".to_string()))?;

    let dtype = yaml_get(map, "datatype")
        .and_then(Yaml::as_str)
        .ok_or_else(|| AsdfError::BadType("ndarray node without datatype".to_string()))
        .and_then(Dtype::from_name)?;

    let shape: Vec<usize> = yaml_get(map, "shape")
        .and_then(Yaml::as_sequence)
        .ok_or_else(|| AsdfError::BadType("ndarray node without shape".to_string()))?
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| AsdfError::BadType("non-integer shape entry".to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    let byteorder = match yaml_get(map, "byteorder").and_then(Yaml::as_str) {
        Some(name) => Endian::from_name(name)?,
        None => Endian::Little,
    };
    let offset = yaml_get(map, "offset").and_then(Yaml::as_u64).unwrap_or(0) as usize;
    let strides = match yaml_get(map, "strides").and_then(Yaml::as_sequence) {
        Some(seq) => Some(
            seq.iter()
                .map(|v| {
                    v.as_u64()
                        .map(|n| n as usize)
                        .ok_or_else(|| AsdfError::BadType("non-integer stride".to_string()))
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };

    let handle = match yaml_get(map, "source") {
        Some(Yaml::Number(n)) => {
            let index = n
                .as_u64()
                .ok_or_else(|| AsdfError::BadType("negative block source".to_string()))?
                as usize;
            ctx.blocks.handle_for_source_index(index)?
        }
        Some(Yaml::String(uri)) => {
            let resolved = resolve_uri(ctx.uri.as_deref(), get_base_uri(uri));
            if ctx.uri.as_deref() == Some(resolved.as_str()) {
                // A source naming the host file is the host's first block.
                ctx.blocks.handle_for_source_index(0)?
            } else {
                let handle = BlockBody::lazy_external(ctx.externals, resolved.clone());
                ctx.blocks.add_external_block(handle.clone(), resolved);
                handle
            }
        }
        Some(other) => {
            return Err(AsdfError::BadType(format!(
                "unsupported ndarray source {other:?}"
            )))
        }
        None => {
            let data = yaml_get(map, "data").ok_or_else(|| {
                AsdfError::BadType("ndarray node with neither source nor data".to_string())
            })?;
            let bytes = inline_to_bytes(data, dtype, &shape)?;
            let handle = BlockBody::materialized(bytes);
            ctx.blocks.add_inline_block(handle.clone());
            handle
        }
    };

    Ok(Value::Array(NdArray::from_parts(
        handle, dtype, shape, strides, offset, byteorder,
    )))
}

/// Flatten nested inline data into a little-endian element buffer.
fn inline_to_bytes(data: &Yaml, dtype: Dtype, shape: &[usize]) -> Result<Vec<u8>> {
    fn flatten<'a>(node: &'a Yaml, shape: &[usize], out: &mut Vec<&'a Yaml>) -> Result<()> {
        match shape.split_first() {
            None => {
                out.push(node);
                Ok(())
            }
            Some((&n, rest)) => {
                let seq = node.as_sequence().ok_or_else(|| {
                    AsdfError::BadType("inline data shallower than shape".to_string())
                })?;
                if seq.len() != n {
                    return Err(AsdfError::BadType(format!(
                        "inline data row of {} elements, shape says {n}",
                        seq.len()
                    )));
                }
                for item in seq {
                    flatten(item, rest, out)?;
                }
                Ok(())
            }
        }
    }

    let mut scalars = Vec::new();
    flatten(data, shape, &mut scalars)?;

    let itemsize = dtype.itemsize();
    let mut bytes = vec![0u8; scalars.len() * itemsize];
    for (i, scalar) in scalars.iter().enumerate() {
        let chunk = &mut bytes[i * itemsize..(i + 1) * itemsize];
        if dtype.is_float() {
            let v = scalar
                .as_f64()
                .ok_or_else(|| AsdfError::BadType("non-numeric inline element".to_string()))?;
            match dtype {
                Dtype::Float32 => LittleEndian::write_u32(chunk, (v as f32).to_bits()),
                _ => LittleEndian::write_u64(chunk, v.to_bits()),
            }
        } else {
            let v = scalar
                .as_i64()
                .ok_or_else(|| AsdfError::BadType("non-integer inline element".to_string()))?;
            match itemsize {
                1 => chunk[0] = v as u8,
                2 => LittleEndian::write_u16(chunk, v as u16),
                4 => LittleEndian::write_u32(chunk, v as u32),
                _ => LittleEndian::write_u64(chunk, v as u64),
            }
        }
    }
    Ok(bytes)
}
