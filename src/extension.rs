//! Tag extensions: schema resolution and per-tag hooks.
//!
//! An extension list maps tag prefixes onto schema URL prefixes, carries
//! embedded schema sources for the core tags (so validation works without
//! touching the network), and holds an optional registry of per-tag hooks
//! that the engine runs at well-defined points:
//!
//! | hook              | when                                        |
//! |-------------------|---------------------------------------------|
//! | `pre_write`       | before blocks are finalized for a write     |
//! | `post_write`      | after a write or update completes           |
//! | `post_read`       | after a file has been opened and converted  |
//! | `copy_to_new_asdf`| when a tree is adopted by a new engine      |
//!
//! Observing hooks see each matching node; modifying hooks may return a
//! replacement node, and the tree is rebuilt bottom-up around it.

use std::collections::HashMap;
use std::rc::Rc;

use crate::constants::{ASDF_TAG, NDARRAY_TAG, SCHEMA_URL_PREFIX, TAG_PREFIX};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreWrite,
    PostWrite,
    PostRead,
    CopyToNewAsdf,
}

impl HookKind {
    pub fn name(self) -> &'static str {
        match self {
            HookKind::PreWrite => "pre_write",
            HookKind::PostWrite => "post_write",
            HookKind::PostRead => "post_read",
            HookKind::CopyToNewAsdf => "copy_to_new_asdf",
        }
    }
}

#[derive(Clone)]
pub enum Hook {
    Observe(Rc<dyn Fn(&Value)>),
    Modify(Rc<dyn Fn(Value) -> Value>),
}

// ── Embedded core schemas ────────────────────────────────────────────────────

const ASDF_SCHEMA: &str = "\
id: \"http://stsci.edu/schemas/asdf/0.1.0/core/asdf\"
type: object
";

const NDARRAY_SCHEMA: &str = "\
id: \"http://stsci.edu/schemas/asdf/0.1.0/core/ndarray\"
type: object
properties:
  source: {}
  data:
    type: array
  datatype:
    type: string
  byteorder:
    type: string
    enum: [little, big]
    default: little
  shape:
    type: array
    items:
      type: integer
  offset:
    type: integer
    default: 0
  strides:
    type: array
    items:
      type: integer
required: [datatype, shape]
";

// ── ExtensionList ────────────────────────────────────────────────────────────

pub struct ExtensionList {
    /// Tag prefix → schema URL prefix, longest prefix wins.
    mappings: Vec<(String, String)>,
    /// Schema URL → embedded source text.
    embedded: HashMap<String, &'static str>,
    /// Full tag → hooks.
    hooks: HashMap<String, HashMap<HookKind, Hook>>,
}

impl ExtensionList {
    /// The built-in extension: the core tag scheme plus embedded schemas
    /// for the document root and `ndarray`.
    pub fn builtin() -> Self {
        let mut embedded = HashMap::new();
        embedded.insert(format!("{SCHEMA_URL_PREFIX}{ASDF_TAG}"), ASDF_SCHEMA);
        embedded.insert(format!("{SCHEMA_URL_PREFIX}{NDARRAY_TAG}"), NDARRAY_SCHEMA);
        Self {
            mappings: vec![(TAG_PREFIX.to_string(), SCHEMA_URL_PREFIX.to_string())],
            embedded,
            hooks: HashMap::new(),
        }
    }

    /// Expand a possibly-short tag to its full `tag:` form.
    pub fn full_tag(tag: &str) -> String {
        if tag.contains(':') {
            tag.to_string()
        } else {
            format!("{TAG_PREFIX}{tag}")
        }
    }

    /// Schema URL for a tag, or `None` when no mapping covers it.
    pub fn tag_to_schema_url(&self, tag: &str) -> Option<String> {
        let full = Self::full_tag(tag);
        self.mappings
            .iter()
            .filter(|(prefix, _)| full.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, url)| format!("{url}{}", &full[prefix.len()..]))
    }

    pub fn embedded_schema(&self, url: &str) -> Option<&'static str> {
        self.embedded.get(url).copied()
    }

    /// Register an additional tag-prefix → URL-prefix mapping.
    pub fn add_mapping(&mut self, tag_prefix: impl Into<String>, url_prefix: impl Into<String>) {
        self.mappings.push((tag_prefix.into(), url_prefix.into()));
    }

    pub fn add_hook(&mut self, tag: &str, kind: HookKind, hook: Hook) {
        self.hooks
            .entry(Self::full_tag(tag))
            .or_default()
            .insert(kind, hook);
    }

    pub fn hook(&self, tag: &str, kind: HookKind) -> Option<&Hook> {
        self.hooks.get(&Self::full_tag(tag))?.get(&kind)
    }

    pub fn has_hooks(&self, kind: HookKind) -> bool {
        self.hooks.values().any(|m| m.contains_key(&kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_full_tags_resolve_alike() {
        let ext = ExtensionList::builtin();
        let from_short = ext.tag_to_schema_url("core/ndarray").unwrap();
        let from_full = ext
            .tag_to_schema_url("tag:stsci.edu:asdf/0.1.0/core/ndarray")
            .unwrap();
        assert_eq!(from_short, from_full);
        assert!(ext.embedded_schema(&from_short).is_some());
    }

    #[test]
    fn unmapped_tag_has_no_schema() {
        let ext = ExtensionList::builtin();
        assert!(ext.tag_to_schema_url("tag:example.com:other/1.0.0/thing").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut ext = ExtensionList::builtin();
        ext.add_mapping(
            "tag:stsci.edu:asdf/0.1.0/core/",
            "http://example.com/core-schemas/",
        );
        assert_eq!(
            ext.tag_to_schema_url("core/ndarray").unwrap(),
            "http://example.com/core-schemas/ndarray"
        );
    }
}
