//! Client-side concurrency control.
//!
//! Sequences local and remote operations for one open model. Local operations
//! are stamped with the server version they were made against and a local
//! sequence number, then held in flight until the server acknowledges them.
//! Remote operations are transformed against everything still in flight, and
//! the in-flight operations are rewritten to sit on top of them.

use crate::error::ConcurrencyError;
use crate::event::{ClientOperationEvent, ServerOperationEvent, SessionId};
use crate::operation::{DiscreteOperation, Operation};
use crate::reference::{ReferenceData, ReferenceTransformer};
use crate::transform::TransformEngine;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::Span;

/// Whether local edits are still waiting for the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// Every local operation has been acknowledged
    Committed,
    /// At least one local operation is in flight
    Modified,
}

/// A local reference stamped with the version it was set at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedReference {
    pub reference: ReferenceData,
    pub version: u64,
}

/// Concurrency control state for one open model
pub struct ConcurrencyControl {
    /// Session local operations are attributed to
    session_id: SessionId,
    /// Shared transformation engine
    engine: Arc<TransformEngine>,
    /// Next server version this client expects to see
    context_version: u64,
    /// Sequence number for the next outgoing operation
    seq_no: u64,
    /// Sent but unacknowledged operations, oldest first
    in_flight: VecDeque<ClientOperationEvent>,
    /// Members of the open batch, if any
    batch: Option<Vec<DiscreteOperation>>,
    /// Transformed remote operations ready to apply
    incoming: VecDeque<ServerOperationEvent>,
    /// Commit state changes not yet drained by the owner
    notifications: Vec<CommitState>,
    span: Span,
}

impl ConcurrencyControl {
    /// Create concurrency control for a model opened at `context_version`.
    pub fn new(
        session_id: SessionId,
        engine: Arc<TransformEngine>,
        context_version: u64,
        span: Span,
    ) -> Self {
        Self {
            session_id,
            engine,
            context_version,
            seq_no: 0,
            in_flight: VecDeque::new(),
            batch: None,
            incoming: VecDeque::new(),
            notifications: Vec::new(),
            span,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Attribute future operations to a new session (after reconnecting).
    pub fn set_session_id(&mut self, session_id: SessionId) {
        self.session_id = session_id;
    }

    pub fn context_version(&self) -> u64 {
        self.context_version
    }

    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    pub fn is_batch_open(&self) -> bool {
        self.batch.is_some()
    }

    /// Check if any local operation is waiting for acknowledgement
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &ClientOperationEvent> {
        self.in_flight.iter()
    }

    // ========== Outgoing ==========

    /// Stamp a local operation for sending.
    ///
    /// Returns `None` while a batch is open; the operation becomes part of the
    /// batch's compound instead.
    pub fn process_outgoing(&mut self, op: Operation) -> Option<ClientOperationEvent> {
        if let Some(batch) = self.batch.as_mut() {
            batch.extend(op.into_members());
            return None;
        }
        Some(self.stamp(op))
    }

    fn stamp(&mut self, operation: Operation) -> ClientOperationEvent {
        let event = ClientOperationEvent {
            session_id: self.session_id.clone(),
            seq_no: self.seq_no,
            context_version: self.context_version,
            timestamp: Utc::now(),
            operation,
        };
        self.seq_no += 1;
        if self.in_flight.is_empty() {
            self.notifications.push(CommitState::Modified);
        }
        self.in_flight.push_back(event.clone());
        event
    }

    pub fn start_batch(&mut self) -> Result<(), ConcurrencyError> {
        if self.batch.is_some() {
            return Err(ConcurrencyError::BatchAlreadyOpen);
        }
        self.batch = Some(Vec::new());
        Ok(())
    }

    /// Close the batch and stamp its members as one compound operation.
    pub fn complete_batch(&mut self) -> Result<Option<ClientOperationEvent>, ConcurrencyError> {
        let members = self.batch.take().ok_or(ConcurrencyError::NoBatchOpen)?;
        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.stamp(Operation::Compound(members))))
    }

    /// Close a batch that accumulated nothing.
    pub fn cancel_batch(&mut self) -> Result<(), ConcurrencyError> {
        match &self.batch {
            None => Err(ConcurrencyError::NoBatchOpen),
            Some(members) if !members.is_empty() => {
                Err(ConcurrencyError::BatchNotEmpty(members.len()))
            }
            Some(_) => {
                self.batch = None;
                Ok(())
            }
        }
    }

    // ========== Incoming ==========

    /// Transform a remote operation against every in-flight operation.
    ///
    /// On success the in-flight queue is rewritten and the transformed remote
    /// operation is queued for [`next_incoming_operation`](Self::next_incoming_operation).
    /// On failure nothing changes.
    pub fn process_remote_operation(
        &mut self,
        event: ServerOperationEvent,
    ) -> Result<(), ConcurrencyError> {
        let _enter = self.span.enter();
        if self.batch.is_some() {
            return Err(ConcurrencyError::RemoteDuringBatch);
        }
        if event.version < self.context_version {
            return Err(ConcurrencyError::VersionRegression {
                context_version: self.context_version,
                received: event.version,
            });
        }

        let mut remote = event.operation.clone();
        let mut rewritten = Vec::with_capacity(self.in_flight.len());
        for pending in &self.in_flight {
            let (server, client) = self.engine.transform(&remote, &pending.operation)?;
            rewritten.push(client);
            remote = server;
        }
        for (pending, operation) in self.in_flight.iter_mut().zip(rewritten) {
            pending.operation = operation;
        }

        tracing::debug!(
            "Remote operation at version {} transformed against {} in-flight",
            event.version,
            self.in_flight.len()
        );
        self.context_version = event.version + 1;
        self.incoming.push_back(ServerOperationEvent {
            operation: remote,
            ..event
        });
        Ok(())
    }

    pub fn has_next_incoming_operation(&self) -> bool {
        !self.incoming.is_empty()
    }

    pub fn next_incoming_operation(&mut self) -> Option<ServerOperationEvent> {
        self.incoming.pop_front()
    }

    /// Retire the oldest in-flight operation.
    ///
    /// Returns the acknowledged event as it stood (transformed) at the time of
    /// acknowledgement.
    pub fn process_acknowledgement(
        &mut self,
        version: u64,
        seq_no: u64,
    ) -> Result<ClientOperationEvent, ConcurrencyError> {
        let _enter = self.span.enter();
        let head = self
            .in_flight
            .front()
            .ok_or(ConcurrencyError::UnexpectedAcknowledgement(seq_no))?;
        if head.seq_no != seq_no {
            return Err(ConcurrencyError::AcknowledgementOutOfOrder {
                expected: head.seq_no,
                actual: seq_no,
            });
        }
        if version < self.context_version {
            return Err(ConcurrencyError::VersionRegression {
                context_version: self.context_version,
                received: version,
            });
        }

        let acked = self
            .in_flight
            .pop_front()
            .ok_or(ConcurrencyError::UnexpectedAcknowledgement(seq_no))?;
        self.context_version = version + 1;
        tracing::debug!("Acknowledged seq {} at version {}", seq_no, version);
        self.notifications.push(if self.in_flight.is_empty() {
            CommitState::Committed
        } else {
            CommitState::Modified
        });
        Ok(acked)
    }

    // ========== References ==========

    /// Stamp a local reference with the current context version.
    pub fn process_outgoing_set_reference(&self, reference: ReferenceData) -> VersionedReference {
        VersionedReference {
            reference,
            version: self.context_version,
        }
    }

    /// Move a remote reference past every in-flight operation.
    ///
    /// `None` means an in-flight operation cleared the reference.
    pub fn process_remote_reference_set(&self, reference: ReferenceData) -> Option<ReferenceData> {
        self.in_flight
            .iter()
            .try_fold(reference, |reference, pending| {
                ReferenceTransformer::transform(&pending.operation, &reference)
            })
    }

    // ========== State ==========

    /// Replace all sequencing state, typically when rehydrating from a log.
    pub fn set_state(
        &mut self,
        context_version: u64,
        seq_no: u64,
        in_flight: Vec<ClientOperationEvent>,
    ) {
        self.context_version = context_version;
        self.seq_no = seq_no;
        self.in_flight = in_flight.into();
        self.incoming.clear();
        self.batch = None;
    }

    pub fn reset_sequence_number(&mut self) {
        self.seq_no = 0;
    }

    /// Restamp every in-flight operation for a fresh send on the current
    /// session and context version, starting from sequence number zero.
    pub fn resend_in_flight(&mut self) -> Vec<ClientOperationEvent> {
        self.reset_sequence_number();
        let pending = std::mem::take(&mut self.in_flight);
        pending
            .into_iter()
            .map(|event| {
                let resent = ClientOperationEvent {
                    session_id: self.session_id.clone(),
                    seq_no: self.seq_no,
                    context_version: self.context_version,
                    timestamp: event.timestamp,
                    operation: event.operation,
                };
                self.seq_no += 1;
                self.in_flight.push_back(resent.clone());
                resent
            })
            .collect()
    }

    /// Remove and return every in-flight operation.
    pub fn take_in_flight(&mut self) -> Vec<ClientOperationEvent> {
        self.in_flight.drain(..).collect()
    }

    pub fn drain_notifications(&mut self) -> Vec<CommitState> {
        std::mem::take(&mut self.notifications)
    }
}
