//! Property-based test generators using proptest.
//!
//! Provides strategies for plain JSON trees of the kind a session mirrors,
//! with and without reserved-marker keys.

use proptest::prelude::*;
use serde_json::{Map, Number, Value};

/// Strategy for keys a session may write.
pub fn plain_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for keys starting with a reserved marker.
pub fn reserved_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[$_][a-zA-Z0-9]{0,8}").expect("Invalid regex")
}

/// Strategy for scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        (-1.0e9f64..1.0e9).prop_map(|f| Number::from_f64(f).map_or(Value::Null, Value::Number)),
        prop::string::string_regex("[ -~]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for nested plain JSON without reserved keys.
pub fn plain_value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map(plain_key_strategy(), inner, 0..6)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Strategy for a plain top-level object, as mirrored by a record session.
pub fn plain_object_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(plain_key_strategy(), plain_value_strategy(), 0..8)
        .prop_map(|map| map.into_iter().collect())
}

/// Strategy for an object that also carries reserved keys at the top level.
pub fn object_with_reserved_keys_strategy() -> impl Strategy<Value = Map<String, Value>> {
    (
        plain_object_strategy(),
        prop::collection::btree_map(reserved_key_strategy(), plain_value_strategy(), 1..4),
    )
        .prop_map(|(mut plain, reserved)| {
            plain.extend(reserved);
            plain
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
