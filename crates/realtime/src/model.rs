//! The single owner of one open model.
//!
//! A [`RealtimeModel`] holds the document tree and the model's
//! [`ResyncController`], carries out every effect the controller emits and
//! queues [`ModelEvent`]s for the application to drain.

use crate::concurrency::CommitState;
use crate::error::{SyncError, SyncResult};
use crate::event::{ResourceId, ServerOperationEvent, SessionId};
use crate::log::{LogHandle, ModelSnapshot};
use crate::message::{ClientMessage, ModelPermissions, RemoteReference, ServerMessage};
use crate::operation::Operation;
use crate::reference::{ReferenceData, ReferenceTransformer};
use crate::resync::{ConnectionState, Effect, ReferenceAction, ResyncController, ResyncNotice};
use crate::transform::TransformEngine;
use model_tree::{DataValue, ModelId, ModelTree, TreeError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Span;

/// Something that happened to a model
#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    /// An operation changed the tree. Local operations are reported in their
    /// applied form.
    OperationApplied { operation: Operation, local: bool },
    CommitStateChanged(CommitState),
    ConnectionStateChanged(ConnectionState),
    /// A collaborator's reference moved. `None` means it was cleared.
    RemoteReferenceChanged {
        session_id: SessionId,
        key: String,
        reference: Option<ReferenceData>,
    },
    CollaboratorsChanged(Vec<SessionId>),
    Closed { reason: String, error: bool },
}

/// Shared collaborators every model of a service uses
#[derive(Clone)]
pub struct ModelContext {
    pub engine: Arc<TransformEngine>,
    /// Messages for the transport
    pub outbox: mpsc::UnboundedSender<ClientMessage>,
    pub log: Option<LogHandle>,
}

/// An open, synchronized model
pub struct RealtimeModel {
    tree: ModelTree,
    controller: ResyncController,
    context: ModelContext,
    permissions: ModelPermissions,
    local_references: HashMap<String, ReferenceData>,
    remote_references: HashMap<(SessionId, String), ReferenceData>,
    connected_clients: Vec<SessionId>,
    events: VecDeque<ModelEvent>,
    closed: bool,
    span: Span,
}

impl RealtimeModel {
    /// A model the server just opened at `version` with `data`.
    pub fn open(
        context: ModelContext,
        session_id: SessionId,
        model_id: ModelId,
        resource_id: ResourceId,
        version: u64,
        data: DataValue,
        permissions: ModelPermissions,
    ) -> Self {
        let span = tracing::info_span!("model", id = %model_id);
        let controller = ResyncController::new(
            model_id,
            resource_id,
            session_id,
            context.engine.clone(),
            version,
            span.clone(),
        );
        Self::with_controller(context, ModelTree::new(data), controller, permissions, span)
    }

    /// Rebuild a model from its offline log. The model starts offline;
    /// call [`on_reconnected`](Self::on_reconnected) to resync it.
    pub fn rehydrate(
        context: ModelContext,
        session_id: SessionId,
        model_id: ModelId,
        snapshot: &ModelSnapshot,
    ) -> SyncResult<Self> {
        let replayed = snapshot.replay()?;
        let span = tracing::info_span!("model", id = %model_id);
        {
            let _enter = span.enter();
            tracing::info!(
                "Rehydrated model {} at version {} with {} local operations",
                model_id,
                replayed.context_version,
                replayed.in_flight.len()
            );
        }
        let controller = ResyncController::rehydrated(
            model_id,
            session_id,
            context.engine.clone(),
            &replayed,
            span.clone(),
        );
        Ok(Self::with_controller(
            context,
            replayed.tree,
            controller,
            ModelPermissions::default(),
            span,
        ))
    }

    fn with_controller(
        context: ModelContext,
        tree: ModelTree,
        controller: ResyncController,
        permissions: ModelPermissions,
        span: Span,
    ) -> Self {
        Self {
            tree,
            controller,
            context,
            permissions,
            local_references: HashMap::new(),
            remote_references: HashMap::new(),
            connected_clients: Vec::new(),
            events: VecDeque::new(),
            closed: false,
            span,
        }
    }

    // ========== Accessors ==========

    pub fn model_id(&self) -> &ModelId {
        self.controller.model_id()
    }

    pub fn resource_id(&self) -> Option<&ResourceId> {
        self.controller.resource_id()
    }

    pub fn session_id(&self) -> &SessionId {
        self.controller.session_id()
    }

    pub fn tree(&self) -> &ModelTree {
        &self.tree
    }

    pub fn data(&self) -> &DataValue {
        self.tree.root()
    }

    /// Next server version this model expects
    pub fn version(&self) -> u64 {
        self.controller.context_version()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn permissions(&self) -> ModelPermissions {
        self.permissions
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether local edits are waiting for the server.
    pub fn has_pending_local(&self) -> bool {
        self.controller.has_in_flight()
    }

    pub fn is_offline_subscribed(&self) -> bool {
        self.controller.is_offline_subscribed()
    }

    pub fn connected_clients(&self) -> &[SessionId] {
        &self.connected_clients
    }

    pub fn local_reference(&self, key: &str) -> Option<&ReferenceData> {
        self.local_references.get(key)
    }

    pub fn remote_reference(&self, session_id: &SessionId, key: &str) -> Option<&ReferenceData> {
        self.remote_references
            .get(&(session_id.clone(), key.to_string()))
    }

    pub fn remote_reference_count(&self) -> usize {
        self.remote_references.len()
    }

    /// Remove and return queued events in order.
    pub fn drain_events(&mut self) -> Vec<ModelEvent> {
        self.events.drain(..).collect()
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed {
            return Err(SyncError::ModelClosed(self.model_id().clone()));
        }
        Ok(())
    }

    // ========== Local Edits ==========

    /// Apply a local edit and queue it for the server. Returns the applied
    /// form of the operation.
    pub fn apply_local(&mut self, op: Operation) -> SyncResult<Operation> {
        self.ensure_open()?;
        let applied = op.apply(&mut self.tree)?;
        self.move_references(&applied);
        self.events.push_back(ModelEvent::OperationApplied {
            operation: applied.clone(),
            local: true,
        });
        self.controller.submit_local(applied.clone());
        self.dispatch_effects()?;
        Ok(applied)
    }

    pub fn start_batch(&mut self) -> SyncResult<()> {
        self.ensure_open()?;
        self.controller.start_batch()
    }

    pub fn complete_batch(&mut self) -> SyncResult<()> {
        self.ensure_open()?;
        self.controller.complete_batch()?;
        self.dispatch_effects()
    }

    pub fn cancel_batch(&mut self) -> SyncResult<()> {
        self.ensure_open()?;
        self.controller.cancel_batch()
    }

    // ========== Inbound ==========

    /// Process a message addressed to this model.
    ///
    /// Fatal errors force the model closed before they are returned.
    pub fn handle_message(&mut self, message: ServerMessage) -> SyncResult<()> {
        self.ensure_open()?;
        let result = self
            .route_message(message)
            .and_then(|()| self.dispatch_effects());
        if let Err(e) = &result {
            if e.is_fatal() && !self.closed {
                {
                    let _enter = self.span.enter();
                    tracing::error!("Closing model {}: {}", self.model_id(), e);
                }
                self.shut_down(e.to_string(), true);
            }
        }
        result
    }

    fn route_message(&mut self, message: ServerMessage) -> SyncResult<()> {
        match message {
            ServerMessage::RemoteOperation {
                session_id,
                version,
                timestamp,
                operation,
                ..
            } => self
                .controller
                .handle_remote_operation(ServerOperationEvent {
                    session_id,
                    version,
                    timestamp,
                    operation,
                }),
            ServerMessage::OperationAcknowledgement {
                version,
                sequence_number,
                ..
            } => self
                .controller
                .handle_acknowledgement(version, sequence_number),
            ServerMessage::ModelResyncResponse {
                resource_id,
                current_version,
                permissions,
                ..
            } => {
                self.permissions = permissions;
                self.controller
                    .handle_resync_response(resource_id, current_version)
            }
            ServerMessage::ModelResyncCompleteResponse {
                connected_clients,
                references,
                ..
            } => self
                .controller
                .handle_resync_complete_response(connected_clients, references),
            ServerMessage::RemoteReferenceShared { reference, .. }
            | ServerMessage::RemoteReferenceSet { reference, .. } => {
                self.set_remote_reference(reference);
                Ok(())
            }
            ServerMessage::RemoteReferenceCleared {
                session_id, key, ..
            }
            | ServerMessage::RemoteReferenceUnshared {
                session_id, key, ..
            } => {
                self.clear_remote_reference(session_id, key);
                Ok(())
            }
            ServerMessage::ModelForceClose { reason, .. } => {
                {
                    let _enter = self.span.enter();
                    tracing::warn!("Server closed model {}: {}", self.model_id(), reason);
                }
                self.shut_down(reason, true);
                Ok(())
            }
            ServerMessage::ModelUpdated { .. } => {
                let _enter = self.span.enter();
                tracing::debug!("Ignoring model update notice for open model {}", self.model_id());
                Ok(())
            }
        }
    }

    // ========== Effects ==========

    /// Carry out everything the controller queued, in order.
    fn dispatch_effects(&mut self) -> SyncResult<()> {
        for effect in self.controller.take_effects() {
            match effect {
                Effect::Send(message) => {
                    if self.context.outbox.send(message).is_err() {
                        let _enter = self.span.enter();
                        tracing::warn!(
                            "Dropped message for model {}: transport closed",
                            self.model_id()
                        );
                    }
                }
                Effect::Apply(event) => self.apply_remote(event)?,
                Effect::Log(command) => {
                    if let Some(log) = &self.context.log {
                        if let Err(e) = log.submit(command) {
                            let _enter = self.span.enter();
                            tracing::warn!("Failed to queue log command: {}", e);
                        }
                    }
                }
                Effect::Notify(notice) => self.handle_notice(notice),
            }
        }
        Ok(())
    }

    fn apply_remote(&mut self, event: ServerOperationEvent) -> SyncResult<()> {
        match event.operation.apply_remote(&mut self.tree) {
            Ok(applied) => {
                self.move_references(&applied);
                self.events.push_back(ModelEvent::OperationApplied {
                    operation: applied,
                    local: false,
                });
                Ok(())
            }
            Err(TreeError::NodeNotFound(id)) => {
                let _enter = self.span.enter();
                tracing::debug!(
                    "Skipping remote operation at version {}: node {} is detached",
                    event.version,
                    id
                );
                Ok(())
            }
            Err(source) => Err(SyncError::Divergence {
                version: event.version,
                source,
            }),
        }
    }

    fn handle_notice(&mut self, notice: ResyncNotice) {
        match notice {
            ResyncNotice::CommitState(state) => {
                self.events.push_back(ModelEvent::CommitStateChanged(state))
            }
            ResyncNotice::StateChanged(state) => {
                self.events
                    .push_back(ModelEvent::ConnectionStateChanged(state))
            }
            ResyncNotice::ResyncComplete {
                connected_clients,
                references,
            } => {
                let stale: Vec<(SessionId, String)> =
                    self.remote_references.keys().cloned().collect();
                for (session_id, key) in stale {
                    self.clear_remote_reference(session_id, key);
                }
                self.connected_clients = connected_clients.clone();
                self.events
                    .push_back(ModelEvent::CollaboratorsChanged(connected_clients));
                for reference in references {
                    let data = reference_data(&reference);
                    self.store_remote_reference(reference.session_id, reference.key, data);
                }
            }
        }
    }

    // ========== References ==========

    /// Move every reference on the edited node through `op`.
    fn move_references(&mut self, op: &Operation) {
        self.local_references.retain(|_, reference| {
            match ReferenceTransformer::transform(op, reference) {
                Some(moved) => {
                    *reference = moved;
                    true
                }
                None => false,
            }
        });

        let mut changed = Vec::new();
        self.remote_references.retain(|(session_id, key), reference| {
            match ReferenceTransformer::transform(op, reference) {
                Some(moved) if moved == *reference => true,
                Some(moved) => {
                    *reference = moved.clone();
                    changed.push((session_id.clone(), key.clone(), Some(moved)));
                    true
                }
                None => {
                    changed.push((session_id.clone(), key.clone(), None));
                    false
                }
            }
        });
        for (session_id, key, reference) in changed {
            self.events.push_back(ModelEvent::RemoteReferenceChanged {
                session_id,
                key,
                reference,
            });
        }
    }

    fn set_remote_reference(&mut self, reference: RemoteReference) {
        if reference.session_id == *self.session_id() {
            return;
        }
        let data = reference_data(&reference)
            .and_then(|data| self.controller.transform_remote_reference(data));
        self.store_remote_reference(reference.session_id, reference.key, data);
    }

    /// Record a reference whose positions are already local. References
    /// without a value or on a detached node are cleared.
    fn store_remote_reference(
        &mut self,
        session_id: SessionId,
        key: String,
        data: Option<ReferenceData>,
    ) {
        let Some(data) = data.filter(|d| self.tree.contains(d.target)) else {
            self.clear_remote_reference(session_id, key);
            return;
        };
        self.remote_references
            .insert((session_id.clone(), key.clone()), data.clone());
        self.events.push_back(ModelEvent::RemoteReferenceChanged {
            session_id,
            key,
            reference: Some(data),
        });
    }

    fn clear_remote_reference(&mut self, session_id: SessionId, key: String) {
        let slot = (session_id, key);
        if self.remote_references.remove(&slot).is_some() {
            let (session_id, key) = slot;
            self.events.push_back(ModelEvent::RemoteReferenceChanged {
                session_id,
                key,
                reference: None,
            });
        }
    }

    fn check_reference_target(&self, reference: &ReferenceData) -> SyncResult<()> {
        if !self.tree.contains(reference.target) {
            return Err(TreeError::NodeNotFound(reference.target).into());
        }
        Ok(())
    }

    /// Publish a local reference under `key`, optionally with a first value.
    pub fn share_reference(&mut self, key: &str, reference: Option<ReferenceData>) -> SyncResult<()> {
        self.ensure_open()?;
        if let Some(reference) = &reference {
            self.check_reference_target(reference)?;
            self.local_references
                .insert(key.to_string(), reference.clone());
        }
        self.controller
            .submit_reference(ReferenceAction::Share, key, reference);
        self.dispatch_effects()
    }

    pub fn set_reference(&mut self, key: &str, reference: ReferenceData) -> SyncResult<()> {
        self.ensure_open()?;
        self.check_reference_target(&reference)?;
        self.local_references
            .insert(key.to_string(), reference.clone());
        self.controller
            .submit_reference(ReferenceAction::Set, key, Some(reference));
        self.dispatch_effects()
    }

    pub fn clear_reference(&mut self, key: &str) -> SyncResult<()> {
        self.ensure_open()?;
        self.local_references.remove(key);
        self.controller
            .submit_reference(ReferenceAction::Clear, key, None);
        self.dispatch_effects()
    }

    pub fn unshare_reference(&mut self, key: &str) -> SyncResult<()> {
        self.ensure_open()?;
        self.local_references.remove(key);
        self.controller
            .submit_reference(ReferenceAction::Unshare, key, None);
        self.dispatch_effects()
    }

    // ========== Connection & Lifecycle ==========

    /// Start or stop mirroring this model into the offline log.
    pub fn set_offline_subscribed(&mut self, subscribed: bool) -> SyncResult<()> {
        self.ensure_open()?;
        self.controller
            .set_offline_subscribed(subscribed, &self.tree)?;
        self.dispatch_effects()
    }

    /// Whether the resync complete request keeps the model open on the server.
    pub fn set_keep_open(&mut self, keep_open: bool) {
        self.controller.set_keep_open(keep_open);
    }

    pub fn on_disconnected(&mut self) -> SyncResult<()> {
        self.ensure_open()?;
        self.controller.on_disconnected();
        self.dispatch_effects()
    }

    pub fn on_reconnected(&mut self, session_id: SessionId) -> SyncResult<()> {
        self.ensure_open()?;
        self.controller.on_reconnected(session_id);
        self.dispatch_effects()
    }

    /// Close the model locally. Logged local operations stay in the log.
    pub fn close(&mut self) {
        if !self.closed {
            self.shut_down("closed locally".to_string(), false);
        }
    }

    fn shut_down(&mut self, reason: String, error: bool) {
        self.controller.close();
        // Anything still queued belongs to the discarded state.
        self.controller.take_effects();
        self.local_references.clear();
        self.remote_references.clear();
        self.closed = true;
        self.events.push_back(ModelEvent::Closed { reason, error });
    }
}

fn reference_data(reference: &RemoteReference) -> Option<ReferenceData> {
    match (reference.value_id, &reference.references) {
        (Some(target), Some(values)) => Some(ReferenceData::new(target, values.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::DiscreteOperation;
    use crate::reference::ReferenceValues;
    use crate::transform::test_support::{item, labels};
    use chrono::Utc;
    use model_tree::{NodeId, Value};

    fn list() -> NodeId {
        NodeId::from_u128(50)
    }

    fn insert(index: usize, label: &str) -> Operation {
        DiscreteOperation::array_insert(list(), index, item(label)).into()
    }

    fn make_model() -> (RealtimeModel, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let context = ModelContext {
            engine: Arc::new(TransformEngine::new()),
            outbox,
            log: None,
        };
        let data = DataValue::with_id(
            list(),
            Value::Array(["a", "b", "c", "d", "e", "f"].iter().map(|l| item(l)).collect()),
        );
        let model = RealtimeModel::open(
            context,
            SessionId::from("s1"),
            ModelId::new("m1"),
            ResourceId::from("r1"),
            10,
            data,
            ModelPermissions::all(),
        );
        (model, rx)
    }

    fn remote_op(session: &str, version: u64, op: Operation) -> ServerMessage {
        ServerMessage::RemoteOperation {
            resource_id: ResourceId::from("r1"),
            session_id: SessionId::from(session),
            version,
            timestamp: Utc::now(),
            operation: op,
        }
    }

    fn ack(version: u64, seq: u64) -> ServerMessage {
        ServerMessage::OperationAcknowledgement {
            resource_id: ResourceId::from("r1"),
            version,
            sequence_number: seq,
            timestamp: Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_local_edit_applies_and_sends() {
        let (mut model, mut rx) = make_model();
        model.apply_local(insert(0, "x")).unwrap();

        assert_eq!(labels(model.tree(), list())[0], "x");
        assert!(model.has_pending_local());
        let sent = drain(&mut rx);
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::OperationSubmission {
                sequence_number: 0,
                context_version: 10,
                ..
            }]
        ));
        let events = model.drain_events();
        assert!(events.contains(&ModelEvent::CommitStateChanged(CommitState::Modified)));
        assert!(matches!(
            events[0],
            ModelEvent::OperationApplied { local: true, .. }
        ));

        model.handle_message(ack(10, 0)).unwrap();
        assert_eq!(model.version(), 11);
        assert!(!model.has_pending_local());
        assert!(model
            .drain_events()
            .contains(&ModelEvent::CommitStateChanged(CommitState::Committed)));
    }

    #[test]
    fn test_invalid_local_edit_is_not_fatal() {
        let (mut model, mut rx) = make_model();
        let err = model.apply_local(insert(40, "x")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert!(!err.is_fatal());
        assert!(!model.is_closed());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_two_clients_insert_at_same_index() {
        let (mut model, mut rx) = make_model();
        model.apply_local(insert(2, "y")).unwrap();
        drain(&mut rx);

        model.handle_message(remote_op("s2", 10, insert(2, "x"))).unwrap();
        model.handle_message(ack(11, 0)).unwrap();

        assert_eq!(
            labels(model.tree(), list()),
            vec!["a", "b", "x", "y", "c", "d", "e", "f"]
        );
        assert_eq!(model.version(), 12);
    }

    #[test]
    fn test_out_of_order_ack_force_closes() {
        let (mut model, _rx) = make_model();
        model.apply_local(insert(0, "x")).unwrap();
        model.apply_local(insert(0, "y")).unwrap();
        model.drain_events();

        let err = model.handle_message(ack(10, 1)).unwrap_err();
        assert!(err.is_fatal());
        assert!(model.is_closed());
        assert!(matches!(
            model.drain_events().as_slice(),
            [ModelEvent::Closed { error: true, .. }]
        ));
        assert!(matches!(
            model.apply_local(insert(0, "z")),
            Err(SyncError::ModelClosed(_))
        ));
    }

    #[test]
    fn test_remote_op_on_detached_node_is_skipped() {
        let (mut model, _rx) = make_model();
        let ghost = NodeId::from_u128(999);
        let op: Operation = DiscreteOperation::string_insert(ghost, 0, "hi").into();
        model.handle_message(remote_op("s2", 10, op)).unwrap();

        assert!(!model.is_closed());
        assert_eq!(model.version(), 11);
        assert!(!model
            .drain_events()
            .iter()
            .any(|e| matches!(e, ModelEvent::OperationApplied { .. })));
    }

    #[test]
    fn test_remote_compound_keeps_members_on_live_nodes() {
        let (mut model, _rx) = make_model();
        model
            .apply_local(DiscreteOperation::array_remove(list(), 1, item("b")).into())
            .unwrap();

        let remote = Operation::Compound(vec![
            DiscreteOperation::string_insert(item("b").id, 0, "X"),
            DiscreteOperation::array_insert(list(), 0, item("z")),
        ]);
        model.handle_message(remote_op("s2", 10, remote)).unwrap();
        model.handle_message(ack(11, 0)).unwrap();

        assert!(!model.is_closed());
        assert_eq!(labels(model.tree(), list()), vec!["z", "a", "c", "d", "e", "f"]);
        assert_eq!(model.version(), 12);
    }

    #[test]
    fn test_remote_apply_failure_is_divergence() {
        let (mut model, _rx) = make_model();
        let op: Operation = DiscreteOperation::array_insert(list(), 40, item("x")).into();
        let err = model.handle_message(remote_op("s2", 10, op)).unwrap_err();
        assert!(matches!(err, SyncError::Divergence { version: 10, .. }));
        assert!(model.is_closed());
    }

    #[test]
    fn test_remote_reference_moves_with_remote_edits() {
        let (mut model, _rx) = make_model();
        model
            .handle_message(ServerMessage::RemoteReferenceSet {
                resource_id: ResourceId::from("r1"),
                reference: RemoteReference {
                    session_id: SessionId::from("s2"),
                    key: "cursor".to_string(),
                    value_id: Some(list()),
                    references: Some(ReferenceValues::Index(vec![5])),
                },
            })
            .unwrap();
        model.drain_events();

        let removal = Operation::Compound(vec![
            DiscreteOperation::array_remove(list(), 2, item("c")),
            DiscreteOperation::array_remove(list(), 2, item("d")),
            DiscreteOperation::array_remove(list(), 2, item("e")),
        ]);
        model.handle_message(remote_op("s3", 10, removal)).unwrap();

        let cursor = model
            .remote_reference(&SessionId::from("s2"), "cursor")
            .unwrap();
        assert_eq!(cursor.values, ReferenceValues::Index(vec![2]));
        assert!(model.drain_events().contains(&ModelEvent::RemoteReferenceChanged {
            session_id: SessionId::from("s2"),
            key: "cursor".to_string(),
            reference: Some(ReferenceData::index(list(), vec![2])),
        }));

        model
            .handle_message(ServerMessage::RemoteReferenceCleared {
                resource_id: ResourceId::from("r1"),
                session_id: SessionId::from("s2"),
                key: "cursor".to_string(),
            })
            .unwrap();
        assert_eq!(model.remote_reference_count(), 0);
    }

    #[test]
    fn test_remote_reference_transformed_through_in_flight() {
        let (mut model, _rx) = make_model();
        model.apply_local(insert(0, "x")).unwrap();
        model
            .handle_message(ServerMessage::RemoteReferenceShared {
                resource_id: ResourceId::from("r1"),
                reference: RemoteReference {
                    session_id: SessionId::from("s2"),
                    key: "cursor".to_string(),
                    value_id: Some(list()),
                    references: Some(ReferenceValues::Index(vec![3])),
                },
            })
            .unwrap();
        assert_eq!(
            model
                .remote_reference(&SessionId::from("s2"), "cursor")
                .unwrap()
                .values,
            ReferenceValues::Index(vec![4])
        );
    }

    #[test]
    fn test_local_references_are_sent_and_moved() {
        let (mut model, mut rx) = make_model();
        model
            .set_reference("cursor", ReferenceData::index(list(), vec![3]))
            .unwrap();
        let sent = drain(&mut rx);
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::SetReference(body)] if body.version == 10 && body.key == "cursor"
        ));

        model.apply_local(insert(0, "x")).unwrap();
        assert_eq!(
            model.local_reference("cursor").unwrap().values,
            ReferenceValues::Index(vec![4])
        );

        let missing = ReferenceData::index(NodeId::from_u128(404), vec![0]);
        assert!(matches!(
            model.set_reference("other", missing),
            Err(SyncError::InvalidOperation(TreeError::NodeNotFound(_)))
        ));

        model.clear_reference("cursor").unwrap();
        assert!(model.local_reference("cursor").is_none());
    }

    #[test]
    fn test_offline_edits_resent_after_resync() {
        let (mut model, mut rx) = make_model();
        model.on_disconnected().unwrap();
        model.apply_local(insert(0, "x")).unwrap();
        assert!(drain(&mut rx).is_empty());

        model.on_reconnected(SessionId::from("s1b")).unwrap();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ClientMessage::ModelResyncRequest {
                context_version: 10,
                ..
            }]
        ));

        model
            .handle_message(remote_op("s2", 10, insert(6, "z")))
            .unwrap_or_else(|e| panic!("{}", e));
        model
            .handle_message(ServerMessage::ModelResyncResponse {
                model_id: ModelId::new("m1"),
                resource_id: ResourceId::from("r2"),
                current_version: 11,
                permissions: ModelPermissions::read_only(),
            })
            .unwrap();

        assert_eq!(model.connection_state(), ConnectionState::Online);
        assert_eq!(model.resource_id(), Some(&ResourceId::from("r2")));
        assert_eq!(model.permissions(), ModelPermissions::read_only());
        let sent = drain(&mut rx);
        assert!(matches!(
            sent.as_slice(),
            [
                ClientMessage::OperationSubmission {
                    sequence_number: 0,
                    context_version: 11,
                    ..
                },
                ClientMessage::ModelResyncCompleteRequest { open: true, .. },
            ]
        ));
        assert_eq!(
            labels(model.tree(), list()),
            vec!["x", "a", "b", "c", "d", "e", "f", "z"]
        );
    }

    #[test]
    fn test_resync_complete_replaces_collaborators() {
        let (mut model, _rx) = make_model();
        model
            .handle_message(ServerMessage::RemoteReferenceSet {
                resource_id: ResourceId::from("r1"),
                reference: RemoteReference {
                    session_id: SessionId::from("gone"),
                    key: "cursor".to_string(),
                    value_id: Some(list()),
                    references: Some(ReferenceValues::Index(vec![1])),
                },
            })
            .unwrap();
        model.drain_events();

        model
            .handle_message(ServerMessage::ModelResyncCompleteResponse {
                resource_id: ResourceId::from("r1"),
                connected_clients: vec![SessionId::from("s2")],
                references: vec![RemoteReference {
                    session_id: SessionId::from("s2"),
                    key: "sel".to_string(),
                    value_id: Some(list()),
                    references: Some(ReferenceValues::Index(vec![0])),
                }],
            })
            .unwrap();

        assert_eq!(model.connected_clients(), &[SessionId::from("s2")]);
        assert!(model
            .remote_reference(&SessionId::from("gone"), "cursor")
            .is_none());
        assert!(model.remote_reference(&SessionId::from("s2"), "sel").is_some());
        let events = model.drain_events();
        assert!(events.contains(&ModelEvent::CollaboratorsChanged(vec![SessionId::from("s2")])));
    }

    #[test]
    fn test_force_close_from_server() {
        let (mut model, _rx) = make_model();
        model
            .handle_message(ServerMessage::ModelForceClose {
                resource_id: ResourceId::from("r1"),
                reason: "deleted".to_string(),
            })
            .unwrap();
        assert!(model.is_closed());
        assert_eq!(
            model.drain_events(),
            vec![ModelEvent::Closed {
                reason: "deleted".to_string(),
                error: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_offline_subscription_writes_server_state() {
        use crate::log::{spawn_log_worker, MemoryOperationLog, OperationLog};

        let backend = Arc::new(MemoryOperationLog::new());
        let (log, mut done, _join) = spawn_log_worker(backend.clone());
        let (mut model, _rx) = make_model();
        model.context.log = Some(log);

        model.apply_local(insert(0, "x")).unwrap();
        model.set_offline_subscribed(true).unwrap();
        model.apply_local(insert(0, "y")).unwrap();

        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(done.recv().await.unwrap().command);
        }
        assert_eq!(names, vec!["write_snapshot", "replace_local", "append_local"]);

        let snapshot = backend.read_snapshot(&ModelId::new("m1")).unwrap().unwrap();
        assert_eq!(snapshot.base_version, 10);
        assert_eq!(snapshot.local_ops.len(), 2);
        let replayed = snapshot.replay().unwrap();
        assert_eq!(replayed.tree, *model.tree());

        model.set_offline_subscribed(false).unwrap();
        assert_eq!(done.recv().await.unwrap().command, "delete");
    }
}
