//! Error types for model tree mutations

use crate::{NodeId, ValueKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Type mismatch on node {node_id}: expected {expected}, found {actual}")]
    TypeMismatch {
        node_id: NodeId,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("Index {index} out of bounds for node {node_id} (length {len})")]
    IndexOutOfBounds {
        node_id: NodeId,
        index: usize,
        len: usize,
    },

    #[error("Property '{key}' not found on node {node_id}")]
    KeyNotFound { node_id: NodeId, key: String },

    #[error("Property '{key}' already exists on node {node_id}")]
    KeyExists { node_id: NodeId, key: String },
}

pub type TreeResult<T> = std::result::Result<T, TreeError>;
