//! Transformation engine.
//!
//! Given a server operation `S` and a client operation `C` created against the
//! same model version, [`TransformEngine::transform`] returns `(S', C')` such
//! that applying `S` then `C'` gives the same model as applying `C` then `S'`.
//!
//! Discrete pairs are looked up in a registry keyed by the two operation types.
//! Operations on different nodes never interact. Operations on the same node
//! with no registered transform are an error: there is no safe default.
//! Compound operations are handled by threading the other side through each
//! member in order.

mod array;
mod object;
mod scalar;
mod string;

use crate::error::TransformError;
use crate::operation::{DiscreteOperation, Operation, OperationType};
use std::collections::HashMap;

/// Transformed `(server, client)` pair
pub type TransformPair = (DiscreteOperation, DiscreteOperation);

/// Transform of a server operation against a client operation on the same node
pub type TransformFn = fn(&DiscreteOperation, &DiscreteOperation) -> TransformPair;

type TransformRegistry = HashMap<(OperationType, OperationType), TransformFn>;

fn register(
    registry: &mut TransformRegistry,
    server: OperationType,
    client: OperationType,
    transform: TransformFn,
) {
    registry.insert((server, client), transform);
}

/// A whole-value set on the server overrides any concurrent client edit.
fn server_set_wins(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    (s.clone(), c.to_no_op())
}

/// A whole-value set on the client overrides a concurrent structural server edit.
fn client_set_wins(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    (s.to_no_op(), c.clone())
}

/// Registry-driven operation transformer
pub struct TransformEngine {
    registry: TransformRegistry,
}

impl TransformEngine {
    /// Create an engine with every built-in transform registered.
    pub fn new() -> Self {
        let mut registry = TransformRegistry::new();
        array::register_all(&mut registry);
        object::register_all(&mut registry);
        string::register_all(&mut registry);
        scalar::register_all(&mut registry);
        Self { registry }
    }

    pub fn has_transform(&self, server: OperationType, client: OperationType) -> bool {
        self.registry.contains_key(&(server, client))
    }

    /// Every registered `(server, client)` type pair.
    pub fn registered_pairs(&self) -> impl Iterator<Item = &(OperationType, OperationType)> {
        self.registry.keys()
    }

    /// Transform two discrete operations.
    pub fn transform_discrete(
        &self,
        server: &DiscreteOperation,
        client: &DiscreteOperation,
    ) -> Result<TransformPair, TransformError> {
        if server.no_op || client.no_op || server.target != client.target {
            return Ok((server.clone(), client.clone()));
        }
        let key = (server.operation_type(), client.operation_type());
        match self.registry.get(&key) {
            Some(transform) => Ok(transform(server, client)),
            None => Err(TransformError::NoTransform {
                server: key.0,
                client: key.1,
                target: server.target,
            }),
        }
    }

    /// Transform two operations, either of which may be compound.
    ///
    /// Compound results keep every member, including members that became
    /// no-ops, so member counts never change.
    pub fn transform(
        &self,
        server: &Operation,
        client: &Operation,
    ) -> Result<(Operation, Operation), TransformError> {
        match (server, client) {
            (Operation::Discrete(s), Operation::Discrete(c)) => {
                let (s, c) = self.transform_discrete(s, c)?;
                Ok((Operation::Discrete(s), Operation::Discrete(c)))
            }
            (Operation::Discrete(s), Operation::Compound(cs)) => {
                let (s, cs) = self.client_members_against(s, cs)?;
                Ok((Operation::Discrete(s), Operation::Compound(cs)))
            }
            (Operation::Compound(ss), Operation::Discrete(c)) => {
                let (ss, c) = self.server_members_against(ss, c)?;
                Ok((Operation::Compound(ss), Operation::Discrete(c)))
            }
            (Operation::Compound(ss), Operation::Compound(cs)) => {
                let mut server = ss.clone();
                let mut transformed = Vec::with_capacity(cs.len());
                for c in cs {
                    let (next, c) = self.server_members_against(&server, c)?;
                    server = next;
                    transformed.push(c);
                }
                Ok((Operation::Compound(server), Operation::Compound(transformed)))
            }
        }
    }

    /// Thread one client operation through the server members in order.
    fn server_members_against(
        &self,
        server: &[DiscreteOperation],
        client: &DiscreteOperation,
    ) -> Result<(Vec<DiscreteOperation>, DiscreteOperation), TransformError> {
        let mut client = client.clone();
        let mut transformed = Vec::with_capacity(server.len());
        for s in server {
            let (s, c) = self.transform_discrete(s, &client)?;
            transformed.push(s);
            client = c;
        }
        Ok((transformed, client))
    }

    /// Thread one server operation through the client members in order.
    fn client_members_against(
        &self,
        server: &DiscreteOperation,
        client: &[DiscreteOperation],
    ) -> Result<(DiscreteOperation, Vec<DiscreteOperation>), TransformError> {
        let mut server = server.clone();
        let mut transformed = Vec::with_capacity(client.len());
        for c in client {
            let (s, c) = self.transform_discrete(&server, c)?;
            transformed.push(c);
            server = s;
        }
        Ok((server, transformed))
    }
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::TransformEngine;
    use crate::operation::{DiscreteOperation, Operation};
    use model_tree::{DataValue, ModelTree, NodeId, Value};

    /// String node whose id is derived from its text, so equal labels build
    /// equal operations.
    pub fn item(label: &str) -> DataValue {
        let id = label
            .bytes()
            .fold(0x5eed_u128, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u128));
        DataValue::with_id(NodeId::from_u128(id), Value::String(label.to_string()))
    }

    /// Tree whose root is an array of strings with the given id.
    pub fn array_of(id: NodeId, labels: &[&str]) -> ModelTree {
        ModelTree::new(DataValue::with_id(
            id,
            Value::Array(labels.iter().map(|l| item(l)).collect()),
        ))
    }

    /// Tree whose root is a string with the given id.
    pub fn string_of(id: NodeId, text: &str) -> ModelTree {
        ModelTree::new(DataValue::with_id(id, Value::String(text.to_string())))
    }

    pub fn labels(tree: &ModelTree, id: NodeId) -> Vec<String> {
        match &tree.find(id).expect("array node").value {
            Value::Array(items) => items
                .iter()
                .map(|item| match &item.value {
                    Value::String(s) => s.clone(),
                    other => format!("{:?}", other),
                })
                .collect(),
            other => panic!("expected array, found {:?}", other),
        }
    }

    pub fn text(tree: &ModelTree, id: NodeId) -> String {
        match &tree.find(id).expect("string node").value {
            Value::String(s) => s.clone(),
            other => panic!("expected string, found {:?}", other),
        }
    }

    /// Apply `s; c'` and `c; s'` to copies of `base`, assert both give the
    /// same tree and return it.
    pub fn assert_converges(
        base: &ModelTree,
        s: &DiscreteOperation,
        c: &DiscreteOperation,
    ) -> ModelTree {
        assert_operations_converge(base, &s.clone().into(), &c.clone().into())
    }

    pub fn assert_operations_converge(base: &ModelTree, s: &Operation, c: &Operation) -> ModelTree {
        let engine = TransformEngine::new();
        let (s2, c2) = engine
            .transform(s, c)
            .unwrap_or_else(|e| panic!("transform failed: {}", e));

        let mut server_side = base.clone();
        s.apply(&mut server_side)
            .unwrap_or_else(|e| panic!("server op {:?} failed: {}", s, e));
        c2.apply(&mut server_side)
            .unwrap_or_else(|e| panic!("transformed client op {:?} failed: {}", c2, e));

        let mut client_side = base.clone();
        c.apply(&mut client_side)
            .unwrap_or_else(|e| panic!("client op {:?} failed: {}", c, e));
        s2.apply(&mut client_side)
            .unwrap_or_else(|e| panic!("transformed server op {:?} failed: {}", s2, e));

        assert_eq!(
            server_side, client_side,
            "diverged for server {:?} / client {:?}",
            s, c
        );
        server_side
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::operation::{OperationKind, ValueFamily};
    use model_tree::{DataValue, NodeId};

    #[test]
    fn test_every_same_family_pair_is_registered() {
        let engine = TransformEngine::new();
        for server in OperationType::ALL {
            for client in OperationType::ALL {
                let same_family = server.family() == client.family();
                assert_eq!(
                    engine.has_transform(server, client),
                    same_family,
                    "{} / {}",
                    server,
                    client
                );
            }
        }
        assert_eq!(engine.registered_pairs().count(), 25 + 16 + 16 + 4 + 1 + 1);
    }

    #[test]
    fn test_cross_family_same_target_is_an_error() {
        let engine = TransformEngine::new();
        let node = NodeId::from_u128(1);
        let s = DiscreteOperation::string_insert(node, 0, "x");
        let c = DiscreteOperation::array_insert(node, 0, DataValue::null());
        let err = engine.transform_discrete(&s, &c).unwrap_err();
        assert_eq!(
            err,
            TransformError::NoTransform {
                server: OperationType::StringInsert,
                client: OperationType::ArrayInsert,
                target: node,
            }
        );
        assert_eq!(OperationType::StringInsert.family(), ValueFamily::String);
    }

    #[test]
    fn test_different_targets_are_identity() {
        let engine = TransformEngine::new();
        let s = DiscreteOperation::string_insert(NodeId::from_u128(1), 0, "x");
        let c = DiscreteOperation::array_insert(NodeId::from_u128(2), 0, DataValue::null());
        assert_eq!(engine.transform_discrete(&s, &c).unwrap(), (s, c));
    }

    #[test]
    fn test_no_op_is_identity() {
        let engine = TransformEngine::new();
        let node = NodeId::from_u128(1);
        let s = DiscreteOperation::string_insert(node, 0, "x").to_no_op();
        let c = DiscreteOperation::array_insert(node, 0, DataValue::null());
        assert_eq!(engine.transform_discrete(&s, &c).unwrap(), (s, c));
    }

    // ========== Compound ==========

    fn list() -> NodeId {
        NodeId::from_u128(7)
    }

    fn insert(index: usize, label: &str) -> DiscreteOperation {
        DiscreteOperation::array_insert(list(), index, DataValue::string(label))
    }

    #[test]
    fn test_compound_equals_sequential_transform() {
        let engine = TransformEngine::new();
        let server = vec![
            insert(0, "s1"),
            DiscreteOperation::array_remove(list(), 3, DataValue::null()),
            DiscreteOperation::array_move(list(), 1, 2),
        ];
        let client = insert(2, "c");

        let (compound_s, compound_c) = engine
            .transform(&Operation::Compound(server.clone()), &client.clone().into())
            .unwrap();

        let mut threaded = client.clone();
        let mut members = Vec::new();
        for s in &server {
            let (s2, c2) = engine.transform_discrete(s, &threaded).unwrap();
            members.push(s2);
            threaded = c2;
        }
        assert_eq!(compound_s, Operation::Compound(members));
        assert_eq!(compound_c, Operation::Discrete(threaded));
    }

    #[test]
    fn test_compound_pairs_converge() {
        let base = array_of(list(), &["a", "b", "c", "d"]);
        let server = Operation::Compound(vec![
            insert(1, "s1"),
            DiscreteOperation::array_move(list(), 0, 4),
            DiscreteOperation::array_remove(list(), 2, DataValue::null()),
        ]);
        let client = Operation::Compound(vec![
            DiscreteOperation::array_remove(list(), 1, DataValue::null()),
            insert(3, "c1"),
            insert(0, "c2"),
        ]);
        assert_operations_converge(&base, &server, &client);
        assert_operations_converge(&base, &server, &client.members()[0].clone().into());
        assert_operations_converge(&base, &server.members()[0].clone().into(), &client);
    }

    #[test]
    fn test_compound_keeps_no_op_members() {
        let engine = TransformEngine::new();
        let target = NodeId::from_u128(3);
        let set = |v: f64| {
            DiscreteOperation::new(
                target,
                OperationKind::NumberSet {
                    value: v,
                    old_value: 0.0,
                },
            )
        };
        let (_, client) = engine
            .transform(
                &set(1.0).into(),
                &Operation::Compound(vec![set(2.0), set(3.0)]),
            )
            .unwrap();
        assert_eq!(client.members().len(), 2);
        assert!(client.is_no_op());
    }
}
