//! Background worker that owns an [`OperationLog`] backend.
//!
//! Writes are fire-and-continue: the owner submits a [`LogCommand`] and keeps
//! going, and the outcome comes back on the completion channel. Failures are
//! logged and reported there; they never reach the synchronization state
//! machines, which keep the operation in memory.

use super::{LogCommand, LogError, LogResult, ModelSnapshot, OperationLog};
use model_tree::ModelId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Outcome of one executed command
#[derive(Clone, Debug, PartialEq)]
pub struct LogCompletion {
    pub model_id: ModelId,
    pub command: &'static str,
    pub result: LogResult<()>,
}

enum Request {
    Command(LogCommand),
    ReadSnapshot {
        model_id: ModelId,
        reply: oneshot::Sender<LogResult<Option<ModelSnapshot>>>,
    },
    ModelIds {
        reply: oneshot::Sender<LogResult<Vec<ModelId>>>,
    },
}

/// Cloneable handle for submitting work to the log worker
#[derive(Clone)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl LogHandle {
    /// Queue a write. Fails only when the worker has stopped.
    pub fn submit(&self, command: LogCommand) -> LogResult<()> {
        self.tx
            .send(Request::Command(command))
            .map_err(|_| LogError::WorkerStopped)
    }

    pub async fn read_snapshot(&self, model_id: &ModelId) -> LogResult<Option<ModelSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::ReadSnapshot {
                model_id: model_id.clone(),
                reply,
            })
            .map_err(|_| LogError::WorkerStopped)?;
        rx.await.map_err(|_| LogError::WorkerStopped)?
    }

    pub async fn model_ids(&self) -> LogResult<Vec<ModelId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::ModelIds { reply })
            .map_err(|_| LogError::WorkerStopped)?;
        rx.await.map_err(|_| LogError::WorkerStopped)?
    }
}

/// Start a worker for `log` on the blocking pool.
///
/// Returns the submission handle, the completion channel and the worker's
/// join handle. The worker exits once every handle has been dropped.
pub fn spawn_log_worker(
    log: Arc<dyn OperationLog>,
) -> (
    LogHandle,
    mpsc::UnboundedReceiver<LogCompletion>,
    JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let join = tokio::task::spawn_blocking(move || {
        tracing::debug!("Operation log worker started");
        while let Some(request) = rx.blocking_recv() {
            match request {
                Request::Command(command) => {
                    let result = command.execute(log.as_ref());
                    if let Err(e) = &result {
                        tracing::warn!(
                            "Log command {} for model {} failed: {}",
                            command.name(),
                            command.model_id(),
                            e
                        );
                    }
                    // The owner may have stopped listening; the write already happened.
                    let _ = done_tx.send(LogCompletion {
                        model_id: command.model_id().clone(),
                        command: command.name(),
                        result,
                    });
                }
                Request::ReadSnapshot { model_id, reply } => {
                    let _ = reply.send(log.read_snapshot(&model_id));
                }
                Request::ModelIds { reply } => {
                    let _ = reply.send(log.model_ids());
                }
            }
        }
        tracing::debug!("Operation log worker stopped");
    });

    (LogHandle { tx }, done_rx, join)
}
