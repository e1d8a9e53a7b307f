//! Schema loading and tag-driven validation.
//!
//! Schemas are identified by URL.  The cache resolves a URL once, from
//! the extension list's embedded sources for the core tags or else by
//! fetching through the generic I/O layer, and keeps the parsed document
//! keyed by that URL for the life of the engine.
//!
//! Validation walks a tagged tree; whenever a tagged node's tag maps to a
//! schema URL, that schema is applied to the node.  A `{$ref: ...}`
//! mapping short-circuits validation of its subtree, since the target
//! lives in another file (known limitation).  Default handling is a
//! strategy of the same walk: `Fill` inserts missing properties that have
//! schema defaults, `Remove` deletes properties equal to their defaults.
//!
//! The supported schema vocabulary is the subset the core schemas use:
//! `type`, `enum`, `properties`, `required`, `items`, `default`.

use std::collections::HashMap;
use std::rc::Rc;

use serde_yaml::Value as Yaml;

use crate::error::{AsdfError, Result};
use crate::extension::ExtensionList;
use crate::generic_io::{open_uri, Mode};
use crate::yamlutil::{tag_str, yaml_get, yaml_get_mut, yaml_remove};

// ── Cache ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SchemaCache {
    loaded: HashMap<String, Rc<Yaml>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or return the cached) schema for `url`.
    pub fn load(&mut self, url: &str, extensions: &ExtensionList) -> Result<Rc<Yaml>> {
        if let Some(schema) = self.loaded.get(url) {
            return Ok(Rc::clone(schema));
        }
        let text = match extensions.embedded_schema(url) {
            Some(src) => src.to_string(),
            None => {
                log::debug!("fetching schema {url}");
                let mut io = open_uri(url, Mode::Read)?;
                let mut bytes = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = io.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    bytes.extend_from_slice(&chunk[..n]);
                }
                String::from_utf8(bytes)
                    .map_err(|_| AsdfError::io_invalid(format!("schema {url} is not UTF-8")))?
            }
        };
        let schema: Yaml = serde_yaml::from_str(&text)?;
        let schema = Rc::new(schema);
        self.loaded.insert(url.to_string(), Rc::clone(&schema));
        Ok(schema)
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultsStrategy {
    /// Plain validation.
    Ignore,
    /// Insert missing properties that carry schema defaults.
    Fill,
    /// Delete properties whose value equals the schema default.
    Remove,
}

/// Walk `root`, applying each tagged node's schema.
pub fn run_validator(
    root: &mut Yaml,
    extensions: &ExtensionList,
    cache: &mut SchemaCache,
    strategy: DefaultsStrategy,
) -> Result<()> {
    walk(root, String::new(), extensions, cache, strategy)
}

fn is_external_ref(node: &Yaml) -> bool {
    match node {
        Yaml::Mapping(m) => m.len() == 1 && yaml_get(m, "$ref").is_some(),
        _ => false,
    }
}

fn walk(
    node: &mut Yaml,
    pointer: String,
    extensions: &ExtensionList,
    cache: &mut SchemaCache,
    strategy: DefaultsStrategy,
) -> Result<()> {
    if is_external_ref(node) {
        return Ok(());
    }
    if let Yaml::Tagged(tagged) = node {
        let tag = tag_str(&tagged.tag);
        if let Some(url) = extensions.tag_to_schema_url(&tag) {
            let schema = cache.load(&url, extensions)?;
            apply_schema(&schema, &mut tagged.value, &pointer, strategy)?;
        }
        return walk(&mut tagged.value, pointer, extensions, cache, strategy);
    }
    match node {
        Yaml::Mapping(map) => {
            for (key, value) in map.iter_mut() {
                let step = key.as_str().map(str::to_string).unwrap_or_default();
                walk(
                    value,
                    format!("{pointer}/{step}"),
                    extensions,
                    cache,
                    strategy,
                )?;
            }
        }
        Yaml::Sequence(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                walk(
                    item,
                    format!("{pointer}/{i}"),
                    extensions,
                    cache,
                    strategy,
                )?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn violation(pointer: &str, message: impl Into<String>) -> AsdfError {
    AsdfError::SchemaViolation {
        pointer: if pointer.is_empty() {
            "/".to_string()
        } else {
            pointer.to_string()
        },
        message: message.into(),
    }
}

fn kind_name(node: &Yaml) -> &'static str {
    match node {
        Yaml::Null => "null",
        Yaml::Bool(_) => "boolean",
        Yaml::Number(n) if n.is_f64() => "number",
        Yaml::Number(_) => "integer",
        Yaml::String(_) => "string",
        Yaml::Sequence(_) => "array",
        Yaml::Mapping(_) => "object",
        Yaml::Tagged(t) => kind_name(&t.value),
    }
}

fn type_matches(node: &Yaml, expected: &str) -> bool {
    match expected {
        // Integers are numbers too.
        "number" => matches!(kind_name(node), "number" | "integer"),
        other => kind_name(node) == other,
    }
}

fn apply_schema(
    schema: &Yaml,
    node: &mut Yaml,
    pointer: &str,
    strategy: DefaultsStrategy,
) -> Result<()> {
    let Some(schema_map) = schema.as_mapping() else {
        return Ok(());
    };

    if let Some(expected) = yaml_get(schema_map, "type").and_then(Yaml::as_str) {
        if !type_matches(node, expected) {
            return Err(violation(
                pointer,
                format!("expected {expected}, found {}", kind_name(node)),
            ));
        }
    }

    if let Some(allowed) = yaml_get(schema_map, "enum").and_then(Yaml::as_sequence) {
        if !allowed.iter().any(|v| v == node) {
            return Err(violation(pointer, "value not in enumeration"));
        }
    }

    if let Some(properties) = yaml_get(schema_map, "properties").and_then(Yaml::as_mapping) {
        for (prop_key, subschema) in properties {
            let Some(name) = prop_key.as_str() else {
                continue;
            };
            let default = subschema
                .as_mapping()
                .and_then(|s| yaml_get(s, "default"));
            let child_pointer = format!("{pointer}/{name}");

            if let Yaml::Mapping(map) = node {
                match (strategy, default) {
                    (DefaultsStrategy::Fill, Some(default)) => {
                        if yaml_get(map, name).is_none() {
                            map.insert(Yaml::String(name.to_string()), default.clone());
                        }
                    }
                    (DefaultsStrategy::Remove, Some(default)) => {
                        if yaml_get(map, name) == Some(default) {
                            yaml_remove(map, name);
                        }
                    }
                    _ => {}
                }
                if let Some(child) = yaml_get_mut(map, name) {
                    apply_schema(subschema, child, &child_pointer, strategy)?;
                }
            }
        }
    }

    if let Some(required) = yaml_get(schema_map, "required").and_then(Yaml::as_sequence) {
        if let Yaml::Mapping(map) = node {
            for name in required.iter().filter_map(Yaml::as_str) {
                if yaml_get(map, name).is_none() {
                    return Err(violation(
                        pointer,
                        format!("missing required property {name:?}"),
                    ));
                }
            }
        }
    }

    if let Some(items_schema) = yaml_get(schema_map, "items") {
        if let Yaml::Sequence(items) = node {
            for (i, item) in items.iter_mut().enumerate() {
                apply_schema(items_schema, item, &format!("{pointer}/{i}"), strategy)?;
            }
        }
    }

    Ok(())
}
