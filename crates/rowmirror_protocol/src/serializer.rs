//! Conversion of a live tree into a transport-safe snapshot.

use crate::value::TreeValue;
use serde_json::{Map, Value};

/// Leading characters that mark a key as session-internal.
pub const RESERVED_MARKERS: [char; 2] = ['$', '_'];

/// Returns true if `key` is reserved for session metadata.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_MARKERS)
}

/// Deep-copies a tree into plain JSON.
///
/// Keys starting with a reserved marker are dropped at every depth.
/// Opaque values are replaced with `null` in place rather than removed, so
/// arrays keep their length and objects keep their keys.
pub fn to_plain(tree: &TreeValue) -> Value {
    match tree {
        TreeValue::Null | TreeValue::Opaque(_) => Value::Null,
        TreeValue::Bool(b) => Value::Bool(*b),
        TreeValue::Number(n) => Value::Number(n.clone()),
        TreeValue::String(s) => Value::String(s.clone()),
        TreeValue::Array(items) => Value::Array(items.iter().map(to_plain).collect()),
        TreeValue::Object(children) => {
            let mut map = Map::new();
            for (key, child) in children {
                if is_reserved_key(key) {
                    continue;
                }
                map.insert(key.clone(), to_plain(child));
            }
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Opaque, TreeMap};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn reserved_keys() {
        assert!(is_reserved_key("$set"));
        assert!(is_reserved_key("_meta"));
        assert!(!is_reserved_key("name"));
        assert!(!is_reserved_key("a_b"));
        assert!(!is_reserved_key(""));
    }

    #[test]
    fn drops_reserved_keys_at_every_depth() {
        let tree = TreeValue::from(json!({
            "keep": 1,
            "_hidden": 2,
            "nested": {"$fn": 3, "ok": [{"_x": 1, "y": 2}]}
        }));

        assert_eq!(
            to_plain(&tree),
            json!({"keep": 1, "nested": {"ok": [{"y": 2}]}})
        );
    }

    #[test]
    fn opaque_values_become_null_in_place() {
        let mut map = TreeMap::new();
        map.insert("handle".into(), Opaque::new(|| ()).into());
        map.insert(
            "list".into(),
            TreeValue::Array(vec![1i64.into(), Opaque::new("x").into(), "z".into()]),
        );

        assert_eq!(
            to_plain(&TreeValue::Object(map)),
            json!({"handle": null, "list": [1, null, "z"]})
        );
    }

    fn plain_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn plain_trees_without_reserved_keys_survive(value in plain_json()) {
            let tree = TreeValue::from(value.clone());
            prop_assert_eq!(to_plain(&tree), value);
        }
    }
}
