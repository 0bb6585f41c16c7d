//! Object transforms.
//!
//! Property edits on different keys never interact. On the same key the
//! server's value wins, except that a concurrent removal never wins over a
//! value write: the write is turned into an add so the property survives.

use super::{register, TransformPair, TransformRegistry};
use crate::operation::{DiscreteOperation, OperationKind, OperationType};
use model_tree::DataValue;

pub(super) fn register_all(registry: &mut TransformRegistry) {
    use OperationType::*;

    register(registry, ObjectAdd, ObjectAdd, add_add);
    register(registry, ObjectAdd, ObjectSetProperty, server_write_wins);
    register(registry, ObjectAdd, ObjectRemoveProperty, server_write_wins);
    register(registry, ObjectSetProperty, ObjectAdd, server_write_wins);
    register(registry, ObjectSetProperty, ObjectSetProperty, set_set);
    register(registry, ObjectSetProperty, ObjectRemoveProperty, set_remove);
    register(registry, ObjectRemoveProperty, ObjectAdd, remove_add);
    register(registry, ObjectRemoveProperty, ObjectSetProperty, remove_set);
    register(registry, ObjectRemoveProperty, ObjectRemoveProperty, remove_remove);

    for other in [ObjectAdd, ObjectSetProperty, ObjectRemoveProperty] {
        register(registry, ObjectSet, other, super::server_set_wins);
        register(registry, other, ObjectSet, super::client_set_wins);
    }
    register(registry, ObjectSet, ObjectSet, super::server_set_wins);
}

fn key_of(op: &DiscreteOperation) -> Option<&str> {
    match &op.kind {
        OperationKind::ObjectAdd { key, .. }
        | OperationKind::ObjectSetProperty { key, .. }
        | OperationKind::ObjectRemoveProperty { key, .. } => Some(key),
        _ => None,
    }
}

fn value_of(op: &DiscreteOperation) -> Option<&DataValue> {
    match &op.kind {
        OperationKind::ObjectAdd { value, .. } | OperationKind::ObjectSetProperty { value, .. } => {
            Some(value)
        }
        OperationKind::ObjectRemoveProperty { old_value, .. } => Some(old_value),
        _ => None,
    }
}

fn same_key(s: &DiscreteOperation, c: &DiscreteOperation) -> bool {
    key_of(s).is_some() && key_of(s) == key_of(c)
}

/// Rewrite a value write as an unconditional property set.
fn as_set_property(op: &DiscreteOperation, previous: Option<&DataValue>) -> DiscreteOperation {
    match &op.kind {
        OperationKind::ObjectAdd { key, value }
        | OperationKind::ObjectSetProperty { key, value, .. } => {
            op.with_kind(OperationKind::ObjectSetProperty {
                key: key.clone(),
                value: value.clone(),
                old_value: previous.cloned(),
            })
        }
        _ => op.clone(),
    }
}

/// Rewrite a value write as an add of a property that no longer exists.
fn as_add(op: &DiscreteOperation) -> DiscreteOperation {
    match &op.kind {
        OperationKind::ObjectSetProperty { key, value, .. } => {
            op.with_kind(OperationKind::ObjectAdd {
                key: key.clone(),
                value: value.clone(),
            })
        }
        _ => op.clone(),
    }
}

fn add_add(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if !same_key(s, c) {
        return (s.clone(), c.clone());
    }
    if value_of(s) == value_of(c) {
        (s.to_no_op(), c.to_no_op())
    } else {
        (as_set_property(s, value_of(c)), c.to_no_op())
    }
}

/// The server value overwrites whatever the client left under the key.
fn server_write_wins(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if !same_key(s, c) {
        return (s.clone(), c.clone());
    }
    let client_left = match &c.kind {
        OperationKind::ObjectRemoveProperty { .. } => None,
        _ => value_of(c),
    };
    (as_set_property(s, client_left), c.to_no_op())
}

fn set_set(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if same_key(s, c) {
        (s.clone(), c.to_no_op())
    } else {
        (s.clone(), c.clone())
    }
}

fn set_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if same_key(s, c) {
        (as_add(s), c.to_no_op())
    } else {
        (s.clone(), c.clone())
    }
}

fn remove_add(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if same_key(s, c) {
        (s.to_no_op(), c.clone())
    } else {
        (s.clone(), c.clone())
    }
}

fn remove_set(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if same_key(s, c) {
        (s.to_no_op(), as_add(c))
    } else {
        (s.clone(), c.clone())
    }
}

fn remove_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if same_key(s, c) {
        (s.to_no_op(), c.to_no_op())
    } else {
        (s.clone(), c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::assert_converges;
    use super::*;
    use model_tree::{ModelTree, NodeId, Value};
    use std::collections::BTreeMap;

    fn obj() -> NodeId {
        NodeId::from_u128(200)
    }

    /// `{"a": 1, "b": 2}`
    fn base() -> ModelTree {
        ModelTree::new(DataValue::with_id(
            obj(),
            Value::Object(
                [("a", 1.0), ("b", 2.0)]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), DataValue::number(v)))
                    .collect(),
            ),
        ))
    }

    fn add(key: &str, v: f64) -> DiscreteOperation {
        DiscreteOperation::new(
            obj(),
            OperationKind::ObjectAdd {
                key: key.into(),
                value: DataValue::number(v),
            },
        )
    }

    fn set(key: &str, v: f64) -> DiscreteOperation {
        DiscreteOperation::object_set_property(obj(), key, DataValue::number(v), None)
    }

    fn remove(key: &str) -> DiscreteOperation {
        DiscreteOperation::new(
            obj(),
            OperationKind::ObjectRemoveProperty {
                key: key.into(),
                old_value: DataValue::null(),
            },
        )
    }

    fn set_all(v: f64) -> DiscreteOperation {
        let mut values = BTreeMap::new();
        values.insert("z".to_string(), DataValue::number(v));
        DiscreteOperation::new(
            obj(),
            OperationKind::ObjectSet {
                values,
                old_values: BTreeMap::new(),
            },
        )
    }

    fn number_at(tree: &ModelTree, key: &str) -> Option<f64> {
        match &tree.find(obj()).unwrap().value {
            Value::Object(map) => map.get(key).map(|v| match v.value {
                Value::Number(n) => n,
                _ => f64::NAN,
            }),
            _ => None,
        }
    }

    #[test]
    fn test_concurrent_adds_server_value_wins() {
        let tree = assert_converges(&base(), &add("c", 1.0), &add("c", 2.0));
        assert_eq!(number_at(&tree, "c"), Some(1.0));
    }

    #[test]
    fn test_identical_adds_collapse() {
        let same = add("c", 5.0);
        let (s, c) = add_add(&same, &same);
        assert!(s.no_op && c.no_op);
        let tree = assert_converges(&base(), &same, &same);
        assert_eq!(number_at(&tree, "c"), Some(5.0));
    }

    #[test]
    fn test_set_set_server_wins() {
        let tree = assert_converges(&base(), &set("a", 10.0), &set("a", 20.0));
        assert_eq!(number_at(&tree, "a"), Some(10.0));
        let tree = assert_converges(&base(), &set("a", 10.0), &set("b", 20.0));
        assert_eq!(number_at(&tree, "b"), Some(20.0));
    }

    #[test]
    fn test_write_survives_concurrent_remove() {
        let tree = assert_converges(&base(), &set("a", 9.0), &remove("a"));
        assert_eq!(number_at(&tree, "a"), Some(9.0));
        let tree = assert_converges(&base(), &remove("a"), &set("a", 8.0));
        assert_eq!(number_at(&tree, "a"), Some(8.0));
    }

    #[test]
    fn test_remove_remove_same_key() {
        let tree = assert_converges(&base(), &remove("b"), &remove("b"));
        assert_eq!(number_at(&tree, "b"), None);
        assert_converges(&base(), &remove("a"), &remove("b"));
    }

    #[test]
    fn test_add_against_other_writes() {
        // The key is absent from the base for the add and present for the
        // others; each side is still applied to its own valid state.
        let tree = assert_converges(&base(), &remove("a"), &add("c", 3.0));
        assert_eq!(number_at(&tree, "a"), None);
        assert_eq!(number_at(&tree, "c"), Some(3.0));
        assert_converges(&base(), &add("c", 3.0), &set("a", 4.0));
        assert_converges(&base(), &set("a", 4.0), &add("c", 3.0));
    }

    #[test]
    fn test_object_set_wins_over_key_edits() {
        let tree = assert_converges(&base(), &set("a", 4.0), &set_all(1.0));
        assert_eq!(number_at(&tree, "z"), Some(1.0));
        assert_eq!(number_at(&tree, "a"), None);
        let tree = assert_converges(&base(), &set_all(1.0), &remove("b"));
        assert_eq!(number_at(&tree, "b"), None);
        let tree = assert_converges(&base(), &set_all(1.0), &set_all(2.0));
        assert_eq!(number_at(&tree, "z"), Some(1.0));
    }
}
