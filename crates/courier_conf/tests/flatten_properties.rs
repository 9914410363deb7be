//! Property tests for flattening nested documents into the key space.

use courier_conf::Configuration;
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Object keys free of the separators the flat key space uses.
const KEY: &str = "[a-zA-Z][a-zA-Z0-9_]{0,5}";

fn object(entries: std::collections::BTreeMap<String, Value>) -> Value {
    Value::Object(entries.into_iter().collect::<Map<String, Value>>())
}

fn json_tree() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        // Quarters are exact in binary, so they survive text round trips
        (-4000i32..4000).prop_map(|n| Value::from(f64::from(n) / 4.0)),
        "[a-zA-Z0-9 _-]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 5, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
            prop::collection::btree_map(KEY, inner, 0..5).prop_map(object),
        ]
    })
}

fn json_document() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(KEY, json_tree(), 0..6).prop_map(object)
}

fn scalar_leaves(node: &Value) -> usize {
    match node {
        Value::Null => 0,
        Value::Array(items) => items.iter().map(scalar_leaves).sum(),
        Value::Object(map) => map.values().map(scalar_leaves).sum(),
        _ => 1,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Every non-null scalar leaf lands under its own key.
    #[test]
    fn test_one_entry_per_scalar_leaf(doc in json_document()) {
        let mut conf = Configuration::new();
        conf.update_from_value(&doc);
        prop_assert_eq!(conf.len(), scalar_leaves(&doc), "document: {}", doc);
    }

    /// The flat JSON form loads back into an identical store.
    #[test]
    fn test_flat_json_round_trip(doc in json_document()) {
        let mut conf = Configuration::new();
        conf.update_from_value(&doc);

        let mut restored = Configuration::new();
        restored.load_from_text(&conf.to_json_str()).unwrap();
        prop_assert_eq!(restored, conf);
    }

    /// Loading the same document twice changes nothing.
    #[test]
    fn test_reload_is_idempotent(doc in json_document()) {
        let mut once = Configuration::new();
        once.update_from_value(&doc);
        let mut twice = once.clone();
        twice.update_from_value(&doc);
        prop_assert_eq!(twice, once);
    }
}
