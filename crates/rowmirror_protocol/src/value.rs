//! Values held by a live local tree.

use serde_json::{Number, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Keyed children of an object node.
pub type TreeMap = BTreeMap<String, TreeValue>;

/// A handle to a value that has no plain JSON form.
///
/// Opaque values may live in a local tree (callbacks, caches, foreign
/// handles) but are never sent to the remote store.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    /// Wraps an arbitrary value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrows the wrapped value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Opaque(..)")
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A node in a live local tree.
///
/// Mirrors the JSON data model, plus `Opaque` for values that cannot be
/// serialized.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TreeValue {
    /// JSON null.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// Ordered list of nodes.
    Array(Vec<TreeValue>),
    /// Keyed map of nodes.
    Object(TreeMap),
    /// A non-plain value.
    Opaque(Opaque),
}

impl TreeValue {
    /// Creates an empty object node.
    pub fn object() -> Self {
        TreeValue::Object(TreeMap::new())
    }

    /// Short name of the node kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TreeValue::Null => "null",
            TreeValue::Bool(_) => "boolean",
            TreeValue::Number(_) => "number",
            TreeValue::String(_) => "string",
            TreeValue::Array(_) => "array",
            TreeValue::Object(_) => "object",
            TreeValue::Opaque(_) => "opaque",
        }
    }

    /// Returns the object children, if this is an object.
    pub fn as_object(&self) -> Option<&TreeMap> {
        match self {
            TreeValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the object children mutably, if this is an object.
    pub fn as_object_mut(&mut self) -> Option<&mut TreeMap> {
        match self {
            TreeValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the array elements, if this is an array.
    pub fn as_array(&self) -> Option<&Vec<TreeValue>> {
        match self {
            TreeValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the array elements mutably, if this is an array.
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<TreeValue>> {
        match self {
            TreeValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the string, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TreeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a child of an object node.
    pub fn get(&self, key: &str) -> Option<&TreeValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Returns true for object and array nodes.
    pub fn is_container(&self) -> bool {
        matches!(self, TreeValue::Object(_) | TreeValue::Array(_))
    }
}

impl From<Value> for TreeValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => TreeValue::Null,
            Value::Bool(b) => TreeValue::Bool(b),
            Value::Number(n) => TreeValue::Number(n),
            Value::String(s) => TreeValue::String(s),
            Value::Array(items) => TreeValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                TreeValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for TreeValue {
    fn from(value: &str) -> Self {
        TreeValue::String(value.to_string())
    }
}

impl From<String> for TreeValue {
    fn from(value: String) -> Self {
        TreeValue::String(value)
    }
}

impl From<bool> for TreeValue {
    fn from(value: bool) -> Self {
        TreeValue::Bool(value)
    }
}

impl From<i64> for TreeValue {
    fn from(value: i64) -> Self {
        TreeValue::Number(value.into())
    }
}

impl From<f64> for TreeValue {
    fn from(value: f64) -> Self {
        // NaN and infinities have no JSON form.
        Number::from_f64(value).map_or(TreeValue::Null, TreeValue::Number)
    }
}

impl From<Opaque> for TreeValue {
    fn from(value: Opaque) -> Self {
        TreeValue::Opaque(value)
    }
}

impl From<TreeMap> for TreeValue {
    fn from(value: TreeMap) -> Self {
        TreeValue::Object(value)
    }
}

impl From<Vec<TreeValue>> for TreeValue {
    fn from(value: Vec<TreeValue>) -> Self {
        TreeValue::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_preserves_shape() {
        let value = TreeValue::from(json!({"a": [1, "two", null], "b": {"c": true}}));
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"].as_array().unwrap().len(), 3);
        assert_eq!(value.get("b").unwrap().get("c"), Some(&TreeValue::Bool(true)));
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(TreeValue::from(f64::NAN), TreeValue::Null);
        assert_eq!(TreeValue::from(f64::INFINITY), TreeValue::Null);
        assert!(matches!(TreeValue::from(1.5), TreeValue::Number(_)));
    }

    #[test]
    fn opaque_equality_is_identity() {
        let a = Opaque::new(42u32);
        let b = a.clone();
        let c = Opaque::new(42u32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_ref::<u32>(), Some(&42));
    }
}
