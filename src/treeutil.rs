//! Tree walking helpers.

use crate::value::{Mapping, Value};

/// Depth-first visit of every node, parents before children.
pub fn iter_tree<'a>(value: &'a Value, f: &mut dyn FnMut(&'a Value)) {
    f(value);
    match value {
        Value::Seq(items) => {
            for item in items {
                iter_tree(item, f);
            }
        }
        Value::Map(map) => {
            for (_, item) in map.iter() {
                iter_tree(item, f);
            }
        }
        _ => {}
    }
}

/// Rebuild the tree bottom-up, applying `f` to every node after its
/// children have been rebuilt.  Mapping order is preserved.
pub fn walk_and_modify(value: Value, f: &mut dyn FnMut(Value) -> Value) -> Value {
    let rebuilt = match value {
        Value::Seq(items) => Value::Seq(
            items
                .into_iter()
                .map(|item| walk_and_modify(item, f))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.into_entries()
                .into_iter()
                .map(|(k, v)| (k, walk_and_modify(v, f)))
                .collect::<Mapping>(),
        ),
        other => other,
    };
    f(rebuilt)
}
