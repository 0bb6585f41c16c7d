//! Persistent operation log for offline availability.
//!
//! For every offline-subscribed model the log keeps a base snapshot, the
//! server operations received since that snapshot, and the local operations
//! still waiting for acknowledgement. Replaying the three rebuilds the model
//! exactly as the client last saw it.
//!
//! Backends implement [`OperationLog`]. The synchronous state machines never
//! call a backend directly: they emit [`LogCommand`]s that a worker task
//! executes (see [`worker`]).

mod file;
mod memory;
pub mod worker;

pub use file::FileOperationLog;
pub use memory::MemoryOperationLog;
pub use worker::{spawn_log_worker, LogCompletion, LogHandle};

use crate::event::{ClientOperationEvent, ServerOperationEvent, SessionId};
use model_tree::{DataValue, ModelId, ModelTree, TreeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by operation log backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("Model not found in log: {0}")]
    ModelNotFound(ModelId),

    #[error("Local operation {seq_no} of session {session_id} not found for model {model_id}")]
    LocalOperationNotFound {
        model_id: ModelId,
        session_id: SessionId,
        seq_no: u64,
    },

    /// The id cannot be used as a storage key.
    #[error("Invalid model id for storage: {0}")]
    InvalidModelId(ModelId),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Log lock poisoned")]
    LockPoisoned,

    #[error("Log worker stopped")]
    WorkerStopped,
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LogError {
    fn from(err: serde_json::Error) -> Self {
        LogError::Serialization(err.to_string())
    }
}

/// Result type for log operations
pub type LogResult<T> = Result<T, LogError>;

/// Everything the log holds for one model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Context version the base data corresponds to
    pub base_version: u64,
    pub base_data: DataValue,
    /// Server operations received after the base, in version order
    pub server_ops: Vec<ServerOperationEvent>,
    /// Unacknowledged local operations, transformed onto the latest server op
    pub local_ops: Vec<ClientOperationEvent>,
}

/// A model rebuilt from its log entries
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayedModel {
    pub tree: ModelTree,
    pub context_version: u64,
    pub seq_no: u64,
    pub in_flight: Vec<ClientOperationEvent>,
}

impl ModelSnapshot {
    pub fn new(base_version: u64, base_data: DataValue) -> Self {
        Self {
            base_version,
            base_data,
            server_ops: Vec::new(),
            local_ops: Vec::new(),
        }
    }

    /// Next server version after everything in the log.
    pub fn server_version(&self) -> u64 {
        self.server_ops
            .last()
            .map(|op| op.version + 1)
            .unwrap_or(self.base_version)
    }

    pub fn has_local_operations(&self) -> bool {
        !self.local_ops.is_empty()
    }

    /// Rebuild the model: base data, then server operations, then local ones.
    ///
    /// Server operations on nodes that no longer exist are skipped, the same
    /// way they were when first received.
    pub fn replay(&self) -> Result<ReplayedModel, TreeError> {
        let mut tree = ModelTree::new(self.base_data.clone());
        for event in &self.server_ops {
            match event.operation.apply_remote(&mut tree) {
                Ok(_) | Err(TreeError::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for event in &self.local_ops {
            event.operation.apply(&mut tree)?;
        }
        Ok(ReplayedModel {
            tree,
            context_version: self.server_version(),
            seq_no: self.local_ops.last().map(|op| op.seq_no + 1).unwrap_or(0),
            in_flight: self.local_ops.clone(),
        })
    }
}

/// Storage backend for offline model data.
///
/// Methods take `&self`; implementations use interior locking so a backend
/// can be shared with the worker through an `Arc`.
pub trait OperationLog: Send + Sync {
    /// Replace the base snapshot and drop logged server operations.
    /// Local operations are kept.
    fn write_snapshot(&self, model_id: &ModelId, version: u64, data: &DataValue) -> LogResult<()>;

    fn read_snapshot(&self, model_id: &ModelId) -> LogResult<Option<ModelSnapshot>>;

    /// Record a newly sent local operation.
    fn append_local_operation(
        &self,
        model_id: &ModelId,
        event: &ClientOperationEvent,
    ) -> LogResult<()>;

    /// Record a server operation exactly as received, together with the
    /// in-flight operations as they were rewritten by it.
    fn append_server_operation(
        &self,
        model_id: &ModelId,
        event: &ServerOperationEvent,
        still_in_flight: &[ClientOperationEvent],
    ) -> LogResult<()>;

    /// Move an acknowledged local operation into the server history.
    fn acknowledge_local_operation(
        &self,
        model_id: &ModelId,
        session_id: &SessionId,
        seq_no: u64,
        event: &ServerOperationEvent,
    ) -> LogResult<()>;

    /// Replace the logged local operations (after a resend restamps them).
    fn replace_local_operations(
        &self,
        model_id: &ModelId,
        in_flight: &[ClientOperationEvent],
    ) -> LogResult<()>;

    fn delete_model(&self, model_id: &ModelId) -> LogResult<()>;

    fn model_ids(&self) -> LogResult<Vec<ModelId>>;
}

/// A write the owner of a model asks the log worker to perform.
#[derive(Clone, Debug, PartialEq)]
pub enum LogCommand {
    WriteSnapshot {
        model_id: ModelId,
        version: u64,
        data: DataValue,
    },
    AppendLocal {
        model_id: ModelId,
        event: ClientOperationEvent,
    },
    AppendServer {
        model_id: ModelId,
        event: ServerOperationEvent,
        in_flight: Vec<ClientOperationEvent>,
    },
    Acknowledge {
        model_id: ModelId,
        session_id: SessionId,
        seq_no: u64,
        event: ServerOperationEvent,
    },
    ReplaceLocal {
        model_id: ModelId,
        in_flight: Vec<ClientOperationEvent>,
    },
    Delete {
        model_id: ModelId,
    },
}

impl LogCommand {
    pub fn model_id(&self) -> &ModelId {
        match self {
            LogCommand::WriteSnapshot { model_id, .. }
            | LogCommand::AppendLocal { model_id, .. }
            | LogCommand::AppendServer { model_id, .. }
            | LogCommand::Acknowledge { model_id, .. }
            | LogCommand::ReplaceLocal { model_id, .. }
            | LogCommand::Delete { model_id } => model_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogCommand::WriteSnapshot { .. } => "write_snapshot",
            LogCommand::AppendLocal { .. } => "append_local",
            LogCommand::AppendServer { .. } => "append_server",
            LogCommand::Acknowledge { .. } => "acknowledge",
            LogCommand::ReplaceLocal { .. } => "replace_local",
            LogCommand::Delete { .. } => "delete",
        }
    }

    /// Run the command against a backend.
    pub fn execute(&self, log: &dyn OperationLog) -> LogResult<()> {
        match self {
            LogCommand::WriteSnapshot {
                model_id,
                version,
                data,
            } => log.write_snapshot(model_id, *version, data),
            LogCommand::AppendLocal { model_id, event } => {
                log.append_local_operation(model_id, event)
            }
            LogCommand::AppendServer {
                model_id,
                event,
                in_flight,
            } => log.append_server_operation(model_id, event, in_flight),
            LogCommand::Acknowledge {
                model_id,
                session_id,
                seq_no,
                event,
            } => log.acknowledge_local_operation(model_id, session_id, *seq_no, event),
            LogCommand::ReplaceLocal {
                model_id,
                in_flight,
            } => log.replace_local_operations(model_id, in_flight),
            LogCommand::Delete { model_id } => log.delete_model(model_id),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::operation::{DiscreteOperation, Operation};
    use crate::transform::test_support::item;
    use model_tree::{NodeId, Value};

    pub fn list() -> NodeId {
        NodeId::from_u128(900)
    }

    pub fn model() -> ModelId {
        ModelId::new("doc-1")
    }

    pub fn base_data() -> DataValue {
        DataValue::with_id(list(), Value::Array(vec![item("a")]))
    }

    pub fn push(index: usize, label: &str) -> Operation {
        DiscreteOperation::array_insert(list(), index, item(label)).into()
    }

    pub fn local(seq_no: u64, context_version: u64, op: Operation) -> ClientOperationEvent {
        ClientOperationEvent {
            session_id: SessionId::from("me"),
            seq_no,
            context_version,
            timestamp: chrono::Utc::now(),
            operation: op,
        }
    }

    pub fn server(version: u64, op: Operation) -> ServerOperationEvent {
        ServerOperationEvent::new(SessionId::from("other"), version, op)
    }

    /// Scenario shared by every backend: snapshot, two local ops, one remote
    /// op that shifts them, then an acknowledgement of the first.
    pub fn exercise_backend(log: &dyn OperationLog) {
        assert_eq!(log.read_snapshot(&model()).unwrap(), None);
        assert_eq!(
            log.append_local_operation(&model(), &local(0, 3, push(1, "x"))),
            Err(LogError::ModelNotFound(model()))
        );

        log.write_snapshot(&model(), 3, &base_data()).unwrap();
        log.append_local_operation(&model(), &local(0, 3, push(1, "x")))
            .unwrap();
        log.append_local_operation(&model(), &local(1, 3, push(2, "y")))
            .unwrap();

        let shifted = vec![local(0, 3, push(2, "x")), local(1, 3, push(3, "y"))];
        log.append_server_operation(&model(), &server(3, push(0, "s")), &shifted)
            .unwrap();

        let acked = ServerOperationEvent::new(SessionId::from("me"), 4, push(2, "x"));
        log.acknowledge_local_operation(&model(), &SessionId::from("me"), 0, &acked)
            .unwrap();

        let snapshot = log.read_snapshot(&model()).unwrap().unwrap();
        assert_eq!(snapshot.base_version, 3);
        assert_eq!(snapshot.server_ops.len(), 2);
        assert_eq!(snapshot.local_ops.len(), 1);
        assert_eq!(snapshot.local_ops[0].seq_no, 1);
        assert_eq!(snapshot.server_version(), 5);

        assert_eq!(
            log.acknowledge_local_operation(&model(), &SessionId::from("me"), 0, &acked),
            Err(LogError::LocalOperationNotFound {
                model_id: model(),
                session_id: SessionId::from("me"),
                seq_no: 0,
            })
        );

        log.write_snapshot(&model(), 5, &base_data()).unwrap();
        let snapshot = log.read_snapshot(&model()).unwrap().unwrap();
        assert!(snapshot.server_ops.is_empty());
        assert_eq!(snapshot.local_ops.len(), 1);

        log.replace_local_operations(&model(), &[]).unwrap();
        assert!(!log.read_snapshot(&model()).unwrap().unwrap().has_local_operations());

        assert_eq!(log.model_ids().unwrap(), vec![model()]);
        log.delete_model(&model()).unwrap();
        assert_eq!(log.read_snapshot(&model()).unwrap(), None);
        assert!(log.model_ids().unwrap().is_empty());
    }
}
