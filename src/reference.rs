//! JSON-style references between trees.
//!
//! A mapping of the single form `{$ref: "<uri>#<pointer>"}` denotes content
//! that lives elsewhere: in another ASDF file, or in this file's own tree.
//! [`find_references`] converts such mappings into [`Reference`] nodes
//! without touching the network or the filesystem; resolving them (and
//! surfacing any load error) happens only when the engine's
//! `resolve_references` is called.

use crate::error::{AsdfError, Result};
use crate::generic_io::get_base_uri;
use crate::treeutil::walk_and_modify;
use crate::value::Value;

/// An unresolved reference to a node in this or another file.
#[derive(Debug, Clone)]
pub struct Reference {
    pub uri: String,
}

impl Reference {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// URI without the fragment.
    pub fn base(&self) -> &str {
        get_base_uri(&self.uri)
    }

    /// Fragment (the pointer), without the leading `#`.
    pub fn fragment(&self) -> &str {
        match self.uri.find('#') {
            Some(i) => &self.uri[i + 1..],
            None => "",
        }
    }
}

fn as_ref_uri(value: &Value) -> Option<&str> {
    let map = value.as_map()?;
    if map.len() != 1 {
        return None;
    }
    map.get("$ref")?.as_str()
}

/// Convert every `{$ref: ...}` mapping into a [`Reference`] node.
pub fn find_references(tree: Value) -> Value {
    walk_and_modify(tree, &mut |v| match as_ref_uri(&v) {
        Some(uri) => Value::Ref(Reference::new(uri)),
        None => v,
    })
}

/// Look up a `/`-separated pointer within a tree.
///
/// The empty pointer names the whole tree.  Sequence steps must parse as
/// indices; anything else is `NotFound`.
pub fn resolve_pointer<'a>(tree: &'a Value, pointer: &str) -> Result<&'a Value> {
    let mut node = tree;
    for step in pointer.split('/').filter(|s| !s.is_empty()) {
        node = match node {
            Value::Map(map) => map
                .get(step)
                .ok_or_else(|| AsdfError::NotFound(format!("no key {step:?} in pointer {pointer:?}")))?,
            Value::Seq(items) => {
                let index: usize = step.parse().map_err(|_| {
                    AsdfError::NotFound(format!("bad sequence index {step:?} in pointer {pointer:?}"))
                })?;
                items.get(index).ok_or_else(|| {
                    AsdfError::NotFound(format!("index {index} out of range in pointer {pointer:?}"))
                })?
            }
            _ => {
                return Err(AsdfError::NotFound(format!(
                    "pointer {pointer:?} descends into a scalar"
                )))
            }
        };
    }
    Ok(node)
}
