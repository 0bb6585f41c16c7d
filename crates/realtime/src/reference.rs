//! Reference (cursor and selection) adjustment.
//!
//! References are position markers anchored to a node. When a concurrent edit
//! shifts content inside that node, index and range references move with it.
//! The `handle_*` functions are pure and saturate at zero.

use crate::operation::{DiscreteOperation, Operation, OperationKind};
use model_tree::NodeId;
use serde::{Deserialize, Serialize};

/// Kind of a reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Index,
    Range,
    Property,
    Element,
}

/// Half-open `[start, end)` span. `start <= end` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub fn new(a: usize, b: usize) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }
}

/// The values of a reference, tagged by reference type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ReferenceValues {
    Index(Vec<usize>),
    Range(Vec<IndexRange>),
    Property(Vec<String>),
    Element(Vec<NodeId>),
}

impl ReferenceValues {
    pub fn reference_type(&self) -> ReferenceType {
        match self {
            ReferenceValues::Index(_) => ReferenceType::Index,
            ReferenceValues::Range(_) => ReferenceType::Range,
            ReferenceValues::Property(_) => ReferenceType::Property,
            ReferenceValues::Element(_) => ReferenceType::Element,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ReferenceValues::Index(v) => v.is_empty(),
            ReferenceValues::Range(v) => v.is_empty(),
            ReferenceValues::Property(v) => v.is_empty(),
            ReferenceValues::Element(v) => v.is_empty(),
        }
    }
}

/// A reference anchored to one node of a model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceData {
    pub target: NodeId,
    pub values: ReferenceValues,
}

impl ReferenceData {
    pub fn new(target: NodeId, values: ReferenceValues) -> Self {
        Self { target, values }
    }

    pub fn index(target: NodeId, positions: Vec<usize>) -> Self {
        Self::new(target, ReferenceValues::Index(positions))
    }

    pub fn range(target: NodeId, ranges: Vec<IndexRange>) -> Self {
        Self::new(target, ReferenceValues::Range(ranges))
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.values.reference_type()
    }
}

// ========== Position Adjustment ==========

/// Positions at or after `index` shift right by `length`.
pub fn handle_insert(positions: &[usize], index: usize, length: usize) -> Vec<usize> {
    positions
        .iter()
        .map(|&p| if p >= index { p + length } else { p })
        .collect()
}

/// Positions after `index` shift left by at most `length`; positions inside
/// the removed span collapse onto `index`.
pub fn handle_remove(positions: &[usize], index: usize, length: usize) -> Vec<usize> {
    positions
        .iter()
        .map(|&p| {
            if p > index {
                p - (p - index).min(length)
            } else {
                p
            }
        })
        .collect()
}

/// Adjust for one element moving from `from` to `to`: positions in
/// `[to, from)` shift right, positions in `[from, to)` shift left.
pub fn handle_reorder(positions: &[usize], from: usize, to: usize) -> Vec<usize> {
    positions
        .iter()
        .map(|&p| {
            if to <= p && p < from {
                p + 1
            } else if from <= p && p < to {
                p.saturating_sub(1)
            } else {
                p
            }
        })
        .collect()
}

fn map_ranges(ranges: &[IndexRange], adjust: impl Fn(&[usize]) -> Vec<usize>) -> Vec<IndexRange> {
    ranges
        .iter()
        .map(|r| {
            let moved = adjust(&[r.start, r.end]);
            IndexRange::new(moved[0], moved[1])
        })
        .collect()
}

pub fn handle_range_insert(ranges: &[IndexRange], index: usize, length: usize) -> Vec<IndexRange> {
    map_ranges(ranges, |p| handle_insert(p, index, length))
}

pub fn handle_range_remove(ranges: &[IndexRange], index: usize, length: usize) -> Vec<IndexRange> {
    map_ranges(ranges, |p| handle_remove(p, index, length))
}

pub fn handle_range_reorder(ranges: &[IndexRange], from: usize, to: usize) -> Vec<IndexRange> {
    map_ranges(ranges, |p| handle_reorder(p, from, to))
}

// ========== Operation → Reference ==========

/// Positional effect of an edit on the content of its target
enum Shift {
    Insert(usize, usize),
    Remove(usize, usize),
    Reorder(usize, usize),
}

/// Moves references through operations.
pub struct ReferenceTransformer;

impl ReferenceTransformer {
    /// Transform `reference` through `op`. `None` means the reference was
    /// cleared by the edit.
    pub fn transform(op: &Operation, reference: &ReferenceData) -> Option<ReferenceData> {
        op.members()
            .iter()
            .try_fold(reference.clone(), |current, member| {
                Self::transform_discrete(member, &current)
            })
    }

    pub fn transform_discrete(
        op: &DiscreteOperation,
        reference: &ReferenceData,
    ) -> Option<ReferenceData> {
        if op.no_op || op.target != reference.target {
            return Some(reference.clone());
        }

        let values = match (&op.kind, &reference.values) {
            (_, ReferenceValues::Element(_)) => return Some(reference.clone()),

            (OperationKind::StringSet { .. }, ReferenceValues::Index(_) | ReferenceValues::Range(_))
            | (OperationKind::ArraySet { .. }, ReferenceValues::Index(_) | ReferenceValues::Range(_)) => {
                return None
            }

            (OperationKind::ObjectRemoveProperty { key, .. }, ReferenceValues::Property(keys)) => {
                ReferenceValues::Property(keys.iter().filter(|k| *k != key).cloned().collect())
            }
            (OperationKind::ObjectSet { values, .. }, ReferenceValues::Property(keys)) => {
                ReferenceValues::Property(
                    keys.iter()
                        .filter(|k| values.contains_key(k.as_str()))
                        .cloned()
                        .collect(),
                )
            }

            (kind, ReferenceValues::Index(positions)) => {
                let mut positions = positions.clone();
                for shift in Self::shifts(kind) {
                    positions = match shift {
                        Shift::Insert(i, n) => handle_insert(&positions, i, n),
                        Shift::Remove(i, n) => handle_remove(&positions, i, n),
                        Shift::Reorder(f, t) => handle_reorder(&positions, f, t),
                    };
                }
                ReferenceValues::Index(positions)
            }
            (kind, ReferenceValues::Range(ranges)) => {
                let mut ranges = ranges.clone();
                for shift in Self::shifts(kind) {
                    ranges = match shift {
                        Shift::Insert(i, n) => handle_range_insert(&ranges, i, n),
                        Shift::Remove(i, n) => handle_range_remove(&ranges, i, n),
                        Shift::Reorder(f, t) => handle_range_reorder(&ranges, f, t),
                    };
                }
                ReferenceValues::Range(ranges)
            }

            (_, ReferenceValues::Property(_)) => return Some(reference.clone()),
        };

        if values.is_empty() {
            return None;
        }
        Some(ReferenceData::new(reference.target, values))
    }

    fn shifts(kind: &OperationKind) -> Vec<Shift> {
        match kind {
            OperationKind::StringInsert { index, value } => {
                vec![Shift::Insert(*index, value.chars().count())]
            }
            OperationKind::StringRemove { index, value } => {
                vec![Shift::Remove(*index, value.chars().count())]
            }
            OperationKind::StringSplice {
                index,
                deleted,
                inserted,
            } => vec![
                Shift::Remove(*index, deleted.chars().count()),
                Shift::Insert(*index, inserted.chars().count()),
            ],
            OperationKind::ArrayInsert { index, .. } => vec![Shift::Insert(*index, 1)],
            OperationKind::ArrayRemove { index, .. } => vec![Shift::Remove(*index, 1)],
            OperationKind::ArrayMove {
                from_index,
                to_index,
            } => vec![Shift::Reorder(*from_index, *to_index)],
            _ => Vec::new(),
        }
    }
}
