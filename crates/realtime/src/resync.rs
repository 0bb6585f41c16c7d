//! Connection-aware synchronization of one model.
//!
//! [`ResyncController`] wraps [`ConcurrencyControl`] with the connection state
//! machine:
//!
//! ```text
//! Online --disconnect--> Offline --reconnect--> Resyncing --caught up--> Online
//! ```
//!
//! While offline nothing is sent and local edits stay in flight. After a
//! reconnect the controller asks the server where it is, catches up on the
//! operations it missed, resends whatever is still in flight and then replays
//! operations that arrived while it was catching up.
//!
//! The controller never touches the tree, the network or storage directly.
//! Every outside action is queued as an [`Effect`] for the owning model to
//! carry out in order.

use crate::concurrency::{CommitState, ConcurrencyControl};
use crate::error::{ResyncError, SyncResult};
use crate::event::{ClientOperationEvent, ResourceId, ServerOperationEvent, SessionId};
use crate::log::{LogCommand, ReplayedModel};
use crate::message::{ClientMessage, ReferenceMessage, RemoteReference};
use crate::operation::Operation;
use crate::reference::ReferenceData;
use crate::transform::TransformEngine;
use model_tree::{ModelId, ModelTree, TreeResult};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::Span;

/// Connection state of one model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
    Resyncing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
            ConnectionState::Resyncing => "resyncing",
        };
        f.write_str(name)
    }
}

/// Something the owner should be told about
#[derive(Clone, Debug, PartialEq)]
pub enum ResyncNotice {
    CommitState(CommitState),
    StateChanged(ConnectionState),
    /// The server finished the resync. References are already moved past
    /// every in-flight operation; cleared ones are dropped.
    ResyncComplete {
        connected_clients: Vec<SessionId>,
        references: Vec<RemoteReference>,
    },
}

/// An action for the owner to carry out
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Send(ClientMessage),
    /// Apply a transformed remote operation to the tree
    Apply(ServerOperationEvent),
    Log(LogCommand),
    Notify(ResyncNotice),
}

/// Which outgoing reference message to send
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceAction {
    Share,
    Set,
    Clear,
    Unshare,
}

/// Connection state machine and sequencing for one model
pub struct ResyncController {
    model_id: ModelId,
    /// Handle of the model on the current connection
    resource_id: Option<ResourceId>,
    state: ConnectionState,
    control: ConcurrencyControl,
    /// Every session this client used for the model
    own_sessions: HashSet<SessionId>,
    /// Server version reported by the resync response
    reconnect_version: Option<u64>,
    /// Remote operations held back until the catch-up completes
    buffered: VecDeque<ServerOperationEvent>,
    /// Whether log commands are emitted
    offline_subscribed: bool,
    /// `open` flag of the resync complete request
    keep_open: bool,
    effects: Vec<Effect>,
    span: Span,
}

impl ResyncController {
    /// Controller for a model that was just opened online at `context_version`.
    pub fn new(
        model_id: ModelId,
        resource_id: ResourceId,
        session_id: SessionId,
        engine: Arc<TransformEngine>,
        context_version: u64,
        span: Span,
    ) -> Self {
        let mut own_sessions = HashSet::new();
        own_sessions.insert(session_id.clone());
        Self {
            model_id,
            resource_id: Some(resource_id),
            state: ConnectionState::Online,
            control: ConcurrencyControl::new(session_id, engine, context_version, span.clone()),
            own_sessions,
            reconnect_version: None,
            buffered: VecDeque::new(),
            offline_subscribed: false,
            keep_open: true,
            effects: Vec::new(),
            span,
        }
    }

    /// Offline controller restored from the operation log.
    ///
    /// The controller starts subscribed and offline; call
    /// [`on_reconnected`](Self::on_reconnected) to resync it.
    pub fn rehydrated(
        model_id: ModelId,
        session_id: SessionId,
        engine: Arc<TransformEngine>,
        replayed: &ReplayedModel,
        span: Span,
    ) -> Self {
        let mut own_sessions: HashSet<SessionId> = replayed
            .in_flight
            .iter()
            .map(|event| event.session_id.clone())
            .collect();
        own_sessions.insert(session_id.clone());
        let mut control =
            ConcurrencyControl::new(session_id, engine, replayed.context_version, span.clone());
        control.set_state(
            replayed.context_version,
            replayed.seq_no,
            replayed.in_flight.clone(),
        );
        Self {
            model_id,
            resource_id: None,
            state: ConnectionState::Offline,
            control,
            own_sessions,
            reconnect_version: None,
            buffered: VecDeque::new(),
            offline_subscribed: true,
            keep_open: true,
            effects: Vec::new(),
            span,
        }
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn resource_id(&self) -> Option<&ResourceId> {
        self.resource_id.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context_version(&self) -> u64 {
        self.control.context_version()
    }

    pub fn session_id(&self) -> &SessionId {
        self.control.session_id()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &ClientOperationEvent> {
        self.control.in_flight()
    }

    pub fn has_in_flight(&self) -> bool {
        self.control.has_in_flight()
    }

    pub fn is_batch_open(&self) -> bool {
        self.control.is_batch_open()
    }

    pub fn is_offline_subscribed(&self) -> bool {
        self.offline_subscribed
    }

    /// Whether the resync complete request asks the server to keep the model open.
    pub fn set_keep_open(&mut self, keep_open: bool) {
        self.keep_open = keep_open;
    }

    /// Remove and return queued effects in emission order.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ========== Local Edits ==========

    /// Sequence an operation that was already applied locally.
    pub fn submit_local(&mut self, op: Operation) {
        if let Some(event) = self.control.process_outgoing(op) {
            self.emit_outgoing(event);
        }
        self.emit_commit_state();
    }

    pub fn start_batch(&mut self) -> SyncResult<()> {
        Ok(self.control.start_batch()?)
    }

    pub fn complete_batch(&mut self) -> SyncResult<()> {
        if let Some(event) = self.control.complete_batch()? {
            self.emit_outgoing(event);
        }
        self.emit_commit_state();
        Ok(())
    }

    pub fn cancel_batch(&mut self) -> SyncResult<()> {
        Ok(self.control.cancel_batch()?)
    }

    fn emit_outgoing(&mut self, event: ClientOperationEvent) {
        if self.offline_subscribed {
            self.effects.push(Effect::Log(LogCommand::AppendLocal {
                model_id: self.model_id.clone(),
                event: event.clone(),
            }));
        }
        if self.state == ConnectionState::Online {
            self.send_submission(event);
        }
    }

    fn send_submission(&mut self, event: ClientOperationEvent) {
        if let Some(resource_id) = &self.resource_id {
            self.effects
                .push(Effect::Send(ClientMessage::OperationSubmission {
                    resource_id: resource_id.clone(),
                    sequence_number: event.seq_no,
                    context_version: event.context_version,
                    operation: event.operation,
                }));
        }
    }

    fn emit_commit_state(&mut self) {
        for state in self.control.drain_notifications() {
            self.effects
                .push(Effect::Notify(ResyncNotice::CommitState(state)));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            let _enter = self.span.enter();
            tracing::debug!("Model {} is now {}", self.model_id, state);
            self.state = state;
            self.effects
                .push(Effect::Notify(ResyncNotice::StateChanged(state)));
        }
    }

    fn unexpected(&self, message: &'static str) -> ResyncError {
        ResyncError::UnexpectedMessage {
            message,
            state: self.state.to_string(),
        }
    }

    // ========== Connection ==========

    pub fn on_disconnected(&mut self) {
        self.reconnect_version = None;
        self.buffered.clear();
        self.set_state(ConnectionState::Offline);
    }

    /// Start resyncing on a new connection session.
    pub fn on_reconnected(&mut self, session_id: SessionId) {
        if self.state != ConnectionState::Offline {
            self.on_disconnected();
        }
        self.own_sessions.insert(session_id.clone());
        self.control.set_session_id(session_id);
        self.set_state(ConnectionState::Resyncing);
        self.effects
            .push(Effect::Send(ClientMessage::ModelResyncRequest {
                model_id: self.model_id.clone(),
                context_version: self.control.context_version(),
            }));
    }

    /// The server answered the resync request.
    ///
    /// `current_version` is the next version the server will assign; the
    /// client is caught up once its context version reaches it.
    pub fn handle_resync_response(
        &mut self,
        resource_id: ResourceId,
        current_version: u64,
    ) -> SyncResult<()> {
        if self.state != ConnectionState::Resyncing || self.reconnect_version.is_some() {
            return Err(self.unexpected("resync response").into());
        }
        {
            let _enter = self.span.enter();
            tracing::info!(
                "Resyncing model {} from version {} to {}",
                self.model_id,
                self.control.context_version(),
                current_version
            );
        }
        self.resource_id = Some(resource_id);
        self.reconnect_version = Some(current_version);

        // Operations that raced the response are sorted again now that the
        // reconnect version is known.
        let early = std::mem::take(&mut self.buffered);
        for event in early {
            self.handle_remote_operation(event)?;
        }
        self.check_caught_up()
    }

    // ========== Incoming ==========

    pub fn handle_remote_operation(&mut self, event: ServerOperationEvent) -> SyncResult<()> {
        match self.state {
            ConnectionState::Offline => Err(self.unexpected("remote operation").into()),
            ConnectionState::Online => self.apply_remote(event),
            ConnectionState::Resyncing => {
                let before_reconnect =
                    matches!(self.reconnect_version, Some(version) if event.version < version);
                if !before_reconnect {
                    self.buffered.push_back(event);
                    return Ok(());
                }
                if self.own_sessions.contains(&event.session_id) {
                    self.acknowledge_echo(event.version)?;
                } else {
                    self.apply_remote(event)?;
                }
                self.check_caught_up()
            }
        }
    }

    fn apply_remote(&mut self, event: ServerOperationEvent) -> SyncResult<()> {
        self.control.process_remote_operation(event.clone())?;
        while let Some(transformed) = self.control.next_incoming_operation() {
            self.effects.push(Effect::Apply(transformed));
        }
        if self.offline_subscribed {
            self.effects.push(Effect::Log(LogCommand::AppendServer {
                model_id: self.model_id.clone(),
                event,
                in_flight: self.control.in_flight().cloned().collect(),
            }));
        }
        Ok(())
    }

    /// An operation this client sent before disconnecting made it into the
    /// server history.
    fn acknowledge_echo(&mut self, version: u64) -> SyncResult<()> {
        let seq_no = self
            .control
            .in_flight()
            .next()
            .map(|event| event.seq_no)
            .ok_or(ResyncError::UnmatchedEcho(version))?;
        self.acknowledge(version, seq_no)
    }

    pub fn handle_acknowledgement(&mut self, version: u64, seq_no: u64) -> SyncResult<()> {
        if self.state != ConnectionState::Online {
            return Err(self.unexpected("operation acknowledgement").into());
        }
        self.acknowledge(version, seq_no)
    }

    fn acknowledge(&mut self, version: u64, seq_no: u64) -> SyncResult<()> {
        let acked = self.control.process_acknowledgement(version, seq_no)?;
        if self.offline_subscribed {
            self.effects.push(Effect::Log(LogCommand::Acknowledge {
                model_id: self.model_id.clone(),
                session_id: acked.session_id.clone(),
                seq_no: acked.seq_no,
                event: ServerOperationEvent::new(acked.session_id, version, acked.operation),
            }));
        }
        self.emit_commit_state();
        Ok(())
    }

    /// Finish the resync once every missed operation has been seen.
    fn check_caught_up(&mut self) -> SyncResult<()> {
        let reconnect_version = match self.reconnect_version {
            Some(version) if self.state == ConnectionState::Resyncing => version,
            _ => return Ok(()),
        };
        if self.control.context_version() < reconnect_version {
            return Ok(());
        }

        self.reconnect_version = None;
        self.set_state(ConnectionState::Online);

        let resent = self.control.resend_in_flight();
        {
            let _enter = self.span.enter();
            tracing::info!(
                "Model {} caught up at version {}, resending {} operations",
                self.model_id,
                reconnect_version,
                resent.len()
            );
        }
        if self.offline_subscribed {
            self.effects.push(Effect::Log(LogCommand::ReplaceLocal {
                model_id: self.model_id.clone(),
                in_flight: resent.clone(),
            }));
        }
        for event in resent {
            self.send_submission(event);
        }

        let buffered = std::mem::take(&mut self.buffered);
        for event in buffered {
            self.apply_remote(event)?;
        }

        if let Some(resource_id) = &self.resource_id {
            self.effects
                .push(Effect::Send(ClientMessage::ModelResyncCompleteRequest {
                    resource_id: resource_id.clone(),
                    open: self.keep_open,
                }));
        }
        Ok(())
    }

    pub fn handle_resync_complete_response(
        &mut self,
        connected_clients: Vec<SessionId>,
        references: Vec<RemoteReference>,
    ) -> SyncResult<()> {
        if self.state != ConnectionState::Online {
            return Err(self.unexpected("resync complete response").into());
        }
        let references = references
            .into_iter()
            .filter_map(|reference| self.transform_remote(reference))
            .collect();
        self.effects
            .push(Effect::Notify(ResyncNotice::ResyncComplete {
                connected_clients,
                references,
            }));
        Ok(())
    }

    // ========== References ==========

    /// Queue an outgoing reference message. Nothing is sent unless online.
    pub fn submit_reference(
        &mut self,
        action: ReferenceAction,
        key: &str,
        reference: Option<ReferenceData>,
    ) {
        if self.state != ConnectionState::Online {
            return;
        }
        let Some(resource_id) = self.resource_id.clone() else {
            return;
        };
        let (value_id, references, version) = match reference {
            Some(reference) => {
                let stamped = self.control.process_outgoing_set_reference(reference);
                (
                    Some(stamped.reference.target),
                    Some(stamped.reference.values),
                    stamped.version,
                )
            }
            None => (None, None, self.control.context_version()),
        };
        let body = ReferenceMessage {
            resource_id,
            key: key.to_string(),
            value_id,
            references,
            version,
        };
        let message = match action {
            ReferenceAction::Share => ClientMessage::ShareReference(body),
            ReferenceAction::Set => ClientMessage::SetReference(body),
            ReferenceAction::Clear => ClientMessage::ClearReference(body),
            ReferenceAction::Unshare => ClientMessage::UnshareReference(body),
        };
        self.effects.push(Effect::Send(message));
    }

    /// Move a remote reference onto the local state. `None` when cleared.
    pub fn transform_remote_reference(&self, reference: ReferenceData) -> Option<ReferenceData> {
        self.control.process_remote_reference_set(reference)
    }

    fn transform_remote(&self, mut reference: RemoteReference) -> Option<RemoteReference> {
        match (reference.value_id, reference.references.take()) {
            (Some(target), Some(values)) => {
                let moved = self.transform_remote_reference(ReferenceData::new(target, values))?;
                reference.references = Some(moved.values);
                Some(reference)
            }
            (_, values) => {
                reference.references = values;
                Some(reference)
            }
        }
    }

    // ========== Offline ==========

    /// Start or stop mirroring this model into the operation log.
    ///
    /// Subscribing writes the server state (the tree with in-flight edits
    /// undone) as the base snapshot, followed by the in-flight operations.
    pub fn set_offline_subscribed(&mut self, subscribed: bool, tree: &ModelTree) -> TreeResult<()> {
        if subscribed == self.offline_subscribed {
            return Ok(());
        }
        if !subscribed {
            self.offline_subscribed = false;
            self.effects.push(Effect::Log(LogCommand::Delete {
                model_id: self.model_id.clone(),
            }));
            return Ok(());
        }

        let mut server_state = tree.clone();
        let in_flight: Vec<ClientOperationEvent> = self.control.in_flight().cloned().collect();
        for event in in_flight.iter().rev() {
            event.operation.inverse().apply(&mut server_state)?;
        }
        self.offline_subscribed = true;
        self.effects.push(Effect::Log(LogCommand::WriteSnapshot {
            model_id: self.model_id.clone(),
            version: self.control.context_version(),
            data: server_state.into_root(),
        }));
        self.effects.push(Effect::Log(LogCommand::ReplaceLocal {
            model_id: self.model_id.clone(),
            in_flight,
        }));
        Ok(())
    }

    /// Drop all in-flight and buffered state. Logged local operations are
    /// kept so a subscribed model can be resynced while closed.
    pub fn close(&mut self) {
        let dropped = self.control.take_in_flight();
        self.buffered.clear();
        self.reconnect_version = None;
        let _enter = self.span.enter();
        tracing::debug!(
            "Closed model {} with {} operations in flight",
            self.model_id,
            dropped.len()
        );
    }
}
