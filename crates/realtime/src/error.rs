//! Error types for the realtime crate.

use crate::config::ConfigError;
use crate::log::LogError;
use crate::operation::OperationType;
use model_tree::{ModelId, NodeId, TreeError};
use thiserror::Error;

/// Result type alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the transformation engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// No transform is registered for two operations on the same node.
    #[error("No transform registered for {server} (server) against {client} (client) on node {target}")]
    NoTransform {
        server: OperationType,
        client: OperationType,
        target: NodeId,
    },
}

/// Errors raised by client concurrency control.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConcurrencyError {
    /// The acknowledged sequence number is not the oldest in-flight one.
    #[error("Acknowledgement out of order: expected seq {expected}, got {actual}")]
    AcknowledgementOutOfOrder { expected: u64, actual: u64 },

    /// An acknowledgement arrived with nothing in flight.
    #[error("Unexpected acknowledgement for seq {0}: no operation in flight")]
    UnexpectedAcknowledgement(u64),

    /// The server reported a version older than what this client has seen.
    #[error("Version went backwards: context version {context_version}, received {received}")]
    VersionRegression { context_version: u64, received: u64 },

    #[error("A batch is already open")]
    BatchAlreadyOpen,

    #[error("No batch is open")]
    NoBatchOpen,

    /// Operations were already applied locally and cannot be dropped.
    #[error("Cannot cancel a batch holding {0} applied operations")]
    BatchNotEmpty(usize),

    /// Remote operations must not interleave with an open batch.
    #[error("Remote operation received while a batch is open")]
    RemoteDuringBatch,

    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl ConcurrencyError {
    /// Protocol violations and transform failures leave the model in an
    /// unknown state. Batch misuse is a local programming error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConcurrencyError::BatchAlreadyOpen
                | ConcurrencyError::NoBatchOpen
                | ConcurrencyError::BatchNotEmpty(_)
        )
    }
}

/// Errors raised by the resynchronization controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResyncError {
    /// A message arrived that the current connection state cannot accept.
    #[error("Unexpected {message} while {state}")]
    UnexpectedMessage { message: &'static str, state: String },

    /// The server echoed one of our operations but nothing is in flight.
    #[error("Echo of own operation at version {0} with nothing in flight")]
    UnmatchedEcho(u64),
}

/// Umbrella error for everything a model can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Concurrency error: {0}")]
    Concurrency(ConcurrencyError),

    #[error("Resync error: {0}")]
    Resync(#[from] ResyncError),

    /// A local edit could not be applied to the tree.
    #[error("Invalid local operation: {0}")]
    InvalidOperation(#[from] TreeError),

    /// A remote edit could not be applied; local and server state diverged.
    #[error("Remote operation at version {version} could not be applied: {source}")]
    Divergence { version: u64, source: TreeError },

    /// The operation log could not be read or written.
    #[error("Storage error: {0}")]
    Storage(#[from] LogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model is closed: {0}")]
    ModelClosed(ModelId),

    #[error("Model is not open: {0}")]
    ModelNotOpen(ModelId),

    #[error("Model is already open: {0}")]
    ModelAlreadyOpen(ModelId),

    /// The offline log holds edits the server has not seen yet.
    #[error("Model {0} has unsynchronized offline operations")]
    PendingLocalOperations(ModelId),
}

impl From<ConcurrencyError> for SyncError {
    fn from(err: ConcurrencyError) -> Self {
        match err {
            ConcurrencyError::Transform(e) => SyncError::Transform(e),
            other => SyncError::Concurrency(other),
        }
    }
}

impl SyncError {
    /// Whether this error forces the affected model closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Transform(_) | SyncError::Resync(_) | SyncError::Divergence { .. } => true,
            SyncError::Concurrency(e) => e.is_fatal(),
            SyncError::InvalidOperation(_)
            | SyncError::Storage(_)
            | SyncError::Config(_)
            | SyncError::ModelClosed(_)
            | SyncError::ModelNotOpen(_)
            | SyncError::ModelAlreadyOpen(_)
            | SyncError::PendingLocalOperations(_) => false,
        }
    }
}
