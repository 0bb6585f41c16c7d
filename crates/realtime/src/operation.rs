//! Operation types for model edits.
//!
//! A [`DiscreteOperation`] is one primitive edit of one node; an
//! [`Operation`] is either a discrete edit or an ordered compound of them that
//! was produced by a local batch. Every discrete operation carries enough data
//! to compute its exact inverse once it has been applied.

use chrono::{DateTime, Utc};
use model_tree::{DataValue, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value family an operation edits. Operations of different families never
/// target the same node in a consistent history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFamily {
    Array,
    Object,
    String,
    Number,
    Boolean,
    Date,
}

/// Tag identifying the variant of a discrete operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ArrayInsert,
    ArrayRemove,
    ArrayMove,
    ArrayReplace,
    ArraySet,
    ObjectAdd,
    ObjectSetProperty,
    ObjectRemoveProperty,
    ObjectSet,
    StringInsert,
    StringRemove,
    StringSplice,
    StringSet,
    NumberSet,
    NumberDelta,
    BooleanSet,
    DateSet,
}

impl OperationType {
    pub const ALL: [OperationType; 17] = [
        OperationType::ArrayInsert,
        OperationType::ArrayRemove,
        OperationType::ArrayMove,
        OperationType::ArrayReplace,
        OperationType::ArraySet,
        OperationType::ObjectAdd,
        OperationType::ObjectSetProperty,
        OperationType::ObjectRemoveProperty,
        OperationType::ObjectSet,
        OperationType::StringInsert,
        OperationType::StringRemove,
        OperationType::StringSplice,
        OperationType::StringSet,
        OperationType::NumberSet,
        OperationType::NumberDelta,
        OperationType::BooleanSet,
        OperationType::DateSet,
    ];

    pub fn family(&self) -> ValueFamily {
        use OperationType::*;
        match self {
            ArrayInsert | ArrayRemove | ArrayMove | ArrayReplace | ArraySet => ValueFamily::Array,
            ObjectAdd | ObjectSetProperty | ObjectRemoveProperty | ObjectSet => {
                ValueFamily::Object
            }
            StringInsert | StringRemove | StringSplice | StringSet => ValueFamily::String,
            NumberSet | NumberDelta => ValueFamily::Number,
            BooleanSet => ValueFamily::Boolean,
            DateSet => ValueFamily::Date,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The edit performed by a discrete operation.
///
/// `old_*` fields describe what the edit displaced. They are filled in by the
/// author and re-stamped with the actual displaced data when the operation is
/// applied, so the inverse of an applied operation is always exact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    ArrayInsert {
        index: usize,
        value: DataValue,
    },
    ArrayRemove {
        index: usize,
        old_value: DataValue,
    },
    ArrayMove {
        from_index: usize,
        to_index: usize,
    },
    ArrayReplace {
        index: usize,
        value: DataValue,
        old_value: DataValue,
    },
    ArraySet {
        values: Vec<DataValue>,
        old_values: Vec<DataValue>,
    },
    ObjectAdd {
        key: String,
        value: DataValue,
    },
    /// `old_value` is `None` when the property did not exist.
    ObjectSetProperty {
        key: String,
        value: DataValue,
        old_value: Option<DataValue>,
    },
    ObjectRemoveProperty {
        key: String,
        old_value: DataValue,
    },
    ObjectSet {
        values: BTreeMap<String, DataValue>,
        old_values: BTreeMap<String, DataValue>,
    },
    StringInsert {
        index: usize,
        value: String,
    },
    StringRemove {
        index: usize,
        value: String,
    },
    /// Replace the characters `deleted` starting at `index` with `inserted`.
    StringSplice {
        index: usize,
        deleted: String,
        inserted: String,
    },
    StringSet {
        value: String,
        old_value: String,
    },
    NumberSet {
        value: f64,
        old_value: f64,
    },
    NumberDelta {
        delta: f64,
    },
    BooleanSet {
        value: bool,
        old_value: bool,
    },
    DateSet {
        value: DateTime<Utc>,
        old_value: DateTime<Utc>,
    },
}

impl OperationKind {
    pub fn operation_type(&self) -> OperationType {
        match self {
            OperationKind::ArrayInsert { .. } => OperationType::ArrayInsert,
            OperationKind::ArrayRemove { .. } => OperationType::ArrayRemove,
            OperationKind::ArrayMove { .. } => OperationType::ArrayMove,
            OperationKind::ArrayReplace { .. } => OperationType::ArrayReplace,
            OperationKind::ArraySet { .. } => OperationType::ArraySet,
            OperationKind::ObjectAdd { .. } => OperationType::ObjectAdd,
            OperationKind::ObjectSetProperty { .. } => OperationType::ObjectSetProperty,
            OperationKind::ObjectRemoveProperty { .. } => OperationType::ObjectRemoveProperty,
            OperationKind::ObjectSet { .. } => OperationType::ObjectSet,
            OperationKind::StringInsert { .. } => OperationType::StringInsert,
            OperationKind::StringRemove { .. } => OperationType::StringRemove,
            OperationKind::StringSplice { .. } => OperationType::StringSplice,
            OperationKind::StringSet { .. } => OperationType::StringSet,
            OperationKind::NumberSet { .. } => OperationType::NumberSet,
            OperationKind::NumberDelta { .. } => OperationType::NumberDelta,
            OperationKind::BooleanSet { .. } => OperationType::BooleanSet,
            OperationKind::DateSet { .. } => OperationType::DateSet,
        }
    }

    /// The edit that undoes this one.
    pub fn inverse(&self) -> OperationKind {
        match self {
            OperationKind::ArrayInsert { index, value } => OperationKind::ArrayRemove {
                index: *index,
                old_value: value.clone(),
            },
            OperationKind::ArrayRemove { index, old_value } => OperationKind::ArrayInsert {
                index: *index,
                value: old_value.clone(),
            },
            OperationKind::ArrayMove {
                from_index,
                to_index,
            } => OperationKind::ArrayMove {
                from_index: *to_index,
                to_index: *from_index,
            },
            OperationKind::ArrayReplace {
                index,
                value,
                old_value,
            } => OperationKind::ArrayReplace {
                index: *index,
                value: old_value.clone(),
                old_value: value.clone(),
            },
            OperationKind::ArraySet { values, old_values } => OperationKind::ArraySet {
                values: old_values.clone(),
                old_values: values.clone(),
            },
            OperationKind::ObjectAdd { key, value } => OperationKind::ObjectRemoveProperty {
                key: key.clone(),
                old_value: value.clone(),
            },
            OperationKind::ObjectSetProperty {
                key,
                value,
                old_value: Some(old_value),
            } => OperationKind::ObjectSetProperty {
                key: key.clone(),
                value: old_value.clone(),
                old_value: Some(value.clone()),
            },
            OperationKind::ObjectSetProperty {
                key,
                value,
                old_value: None,
            } => OperationKind::ObjectRemoveProperty {
                key: key.clone(),
                old_value: value.clone(),
            },
            OperationKind::ObjectRemoveProperty { key, old_value } => OperationKind::ObjectAdd {
                key: key.clone(),
                value: old_value.clone(),
            },
            OperationKind::ObjectSet { values, old_values } => OperationKind::ObjectSet {
                values: old_values.clone(),
                old_values: values.clone(),
            },
            OperationKind::StringInsert { index, value } => OperationKind::StringRemove {
                index: *index,
                value: value.clone(),
            },
            OperationKind::StringRemove { index, value } => OperationKind::StringInsert {
                index: *index,
                value: value.clone(),
            },
            OperationKind::StringSplice {
                index,
                deleted,
                inserted,
            } => OperationKind::StringSplice {
                index: *index,
                deleted: inserted.clone(),
                inserted: deleted.clone(),
            },
            OperationKind::StringSet { value, old_value } => OperationKind::StringSet {
                value: old_value.clone(),
                old_value: value.clone(),
            },
            OperationKind::NumberSet { value, old_value } => OperationKind::NumberSet {
                value: *old_value,
                old_value: *value,
            },
            OperationKind::NumberDelta { delta } => OperationKind::NumberDelta { delta: -delta },
            OperationKind::BooleanSet { value, old_value } => OperationKind::BooleanSet {
                value: *old_value,
                old_value: *value,
            },
            OperationKind::DateSet { value, old_value } => OperationKind::DateSet {
                value: *old_value,
                old_value: *value,
            },
        }
    }
}

/// One primitive edit of a single node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscreteOperation {
    /// Node the edit applies to
    pub target: NodeId,
    /// Set when a transform nullified the edit. No-op operations are still
    /// sent and acknowledged but change nothing.
    #[serde(default)]
    pub no_op: bool,
    pub kind: OperationKind,
}

impl DiscreteOperation {
    pub fn new(target: NodeId, kind: OperationKind) -> Self {
        Self {
            target,
            no_op: false,
            kind,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        self.kind.operation_type()
    }

    pub fn inverse(&self) -> DiscreteOperation {
        DiscreteOperation {
            target: self.target,
            no_op: self.no_op,
            kind: self.kind.inverse(),
        }
    }

    /// Same target, nullified
    pub fn to_no_op(&self) -> DiscreteOperation {
        DiscreteOperation {
            no_op: true,
            ..self.clone()
        }
    }

    /// Same target and no-op flag, different edit
    pub fn with_kind(&self, kind: OperationKind) -> DiscreteOperation {
        DiscreteOperation {
            target: self.target,
            no_op: self.no_op,
            kind,
        }
    }

    // ========== Constructors ==========

    pub fn array_insert(target: NodeId, index: usize, value: DataValue) -> Self {
        Self::new(target, OperationKind::ArrayInsert { index, value })
    }

    pub fn array_remove(target: NodeId, index: usize, old_value: DataValue) -> Self {
        Self::new(target, OperationKind::ArrayRemove { index, old_value })
    }

    pub fn array_move(target: NodeId, from_index: usize, to_index: usize) -> Self {
        Self::new(
            target,
            OperationKind::ArrayMove {
                from_index,
                to_index,
            },
        )
    }

    pub fn object_set_property(
        target: NodeId,
        key: impl Into<String>,
        value: DataValue,
        old_value: Option<DataValue>,
    ) -> Self {
        Self::new(
            target,
            OperationKind::ObjectSetProperty {
                key: key.into(),
                value,
                old_value,
            },
        )
    }

    pub fn string_insert(target: NodeId, index: usize, value: impl Into<String>) -> Self {
        Self::new(
            target,
            OperationKind::StringInsert {
                index,
                value: value.into(),
            },
        )
    }

    pub fn string_remove(target: NodeId, index: usize, value: impl Into<String>) -> Self {
        Self::new(
            target,
            OperationKind::StringRemove {
                index,
                value: value.into(),
            },
        )
    }

    pub fn number_delta(target: NodeId, delta: f64) -> Self {
        Self::new(target, OperationKind::NumberDelta { delta })
    }
}

/// A discrete edit or an atomic batch of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Discrete(DiscreteOperation),
    Compound(Vec<DiscreteOperation>),
}

impl Operation {
    /// Inverse of a compound reverses member order and inverts each member.
    pub fn inverse(&self) -> Operation {
        match self {
            Operation::Discrete(op) => Operation::Discrete(op.inverse()),
            Operation::Compound(ops) => {
                Operation::Compound(ops.iter().rev().map(DiscreteOperation::inverse).collect())
            }
        }
    }

    /// True when applying the operation changes nothing.
    pub fn is_no_op(&self) -> bool {
        match self {
            Operation::Discrete(op) => op.no_op,
            Operation::Compound(ops) => ops.iter().all(|op| op.no_op),
        }
    }

    /// Member operations in application order.
    pub fn members(&self) -> &[DiscreteOperation] {
        match self {
            Operation::Discrete(op) => std::slice::from_ref(op),
            Operation::Compound(ops) => ops,
        }
    }

    /// Distinct nodes touched by the operation, in first-touch order.
    pub fn targets(&self) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for op in self.members() {
            if !targets.contains(&op.target) {
                targets.push(op.target);
            }
        }
        targets
    }

    pub fn into_members(self) -> Vec<DiscreteOperation> {
        match self {
            Operation::Discrete(op) => vec![op],
            Operation::Compound(ops) => ops,
        }
    }
}

impl From<DiscreteOperation> for Operation {
    fn from(op: DiscreteOperation) -> Self {
        Operation::Discrete(op)
    }
}
