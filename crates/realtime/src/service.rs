//! Model service: owns every open model of one client connection.
//!
//! Inbound messages are routed to models by resource id (resync responses by
//! model id, since they carry the new resource). The service drives
//! connection changes into every model, keeps the offline table and, after a
//! reconnect, resyncs closed offline models that still hold local edits.

use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{ResourceId, SessionId};
use crate::log::{spawn_log_worker, LogCompletion, LogError, LogHandle};
use crate::message::{ClientMessage, ModelPermissions, ServerMessage};
use crate::model::{ModelContext, ModelEvent, RealtimeModel};
use crate::offline::OfflineManager;
use crate::resync::ConnectionState;
use crate::transform::TransformEngine;
use model_tree::{DataValue, ModelId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Routes server messages to models and coordinates reconnects.
pub struct ModelService {
    config: ClientConfig,
    context: ModelContext,
    session_id: SessionId,
    connected: bool,
    models: HashMap<ModelId, RealtimeModel>,
    resources: HashMap<ResourceId, ModelId>,
    offline: OfflineManager,
    /// Models closed once their resync finishes. The flag says whether their
    /// events are reported.
    closing_after_resync: HashMap<ModelId, bool>,
    completions: Option<mpsc::UnboundedReceiver<LogCompletion>>,
    events: VecDeque<(ModelId, ModelEvent)>,
}

impl ModelService {
    /// Validate `config`, start the log worker if offline support is enabled
    /// and restore the offline table from the log.
    ///
    /// Finished log commands queue up until they are read with
    /// [`poll_log_completions`](Self::poll_log_completions) or
    /// [`next_log_completion`](Self::next_log_completion). Embedders that do
    /// not read them call
    /// [`discard_log_completions`](Self::discard_log_completions).
    pub async fn start(
        config: ClientConfig,
        session_id: SessionId,
        outbox: mpsc::UnboundedSender<ClientMessage>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (log, completions) = match config.open_log()? {
            Some(backend) => {
                let (handle, completions, _worker) = spawn_log_worker(backend);
                (Some(handle), Some(completions))
            }
            None => (None, None),
        };

        let mut offline = OfflineManager::new(outbox.clone(), log.clone());
        if let Some(log) = &log {
            for model_id in log.model_ids().await? {
                if let Some(snapshot) = log.read_snapshot(&model_id).await? {
                    offline.restore(
                        model_id,
                        snapshot.server_version(),
                        snapshot.has_local_operations(),
                    );
                }
            }
            tracing::info!(
                "Restored {} offline models, {} with local operations",
                offline.model_ids().len(),
                offline.closed_with_pending_local().len()
            );
        }

        Ok(Self {
            config,
            context: ModelContext {
                engine: Arc::new(TransformEngine::new()),
                outbox,
                log,
            },
            session_id,
            connected: true,
            models: HashMap::new(),
            resources: HashMap::new(),
            offline,
            closing_after_resync: HashMap::new(),
            completions,
            events: VecDeque::new(),
        })
    }

    // ========== Accessors ==========

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn offline(&self) -> &OfflineManager {
        &self.offline
    }

    /// Whether the application has `model_id` open.
    pub fn is_open(&self, model_id: &ModelId) -> bool {
        self.models.contains_key(model_id) && !self.closing_after_resync.contains_key(model_id)
    }

    pub fn model(&self, model_id: &ModelId) -> Option<&RealtimeModel> {
        self.models.get(model_id)
    }

    pub fn model_mut(&mut self, model_id: &ModelId) -> Option<&mut RealtimeModel> {
        self.models.get_mut(model_id)
    }

    pub fn open_model_ids(&self) -> Vec<ModelId> {
        let mut ids: Vec<ModelId> = self
            .models
            .keys()
            .filter(|id| !self.closing_after_resync.contains_key(*id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Remove and return queued events of every reported model.
    pub fn drain_events(&mut self) -> Vec<(ModelId, ModelEvent)> {
        let mut events: Vec<(ModelId, ModelEvent)> = self.events.drain(..).collect();
        for (model_id, model) in &mut self.models {
            if self.closing_after_resync.get(model_id) == Some(&false) {
                model.drain_events();
                continue;
            }
            events.extend(
                model
                    .drain_events()
                    .into_iter()
                    .map(|event| (model_id.clone(), event)),
            );
        }
        events
    }

    fn log(&self) -> Option<&LogHandle> {
        self.context.log.as_ref()
    }

    // ========== Open & Close ==========

    /// Register a model the server opened on this connection.
    pub fn open_model(
        &mut self,
        model_id: ModelId,
        resource_id: ResourceId,
        version: u64,
        data: DataValue,
        permissions: ModelPermissions,
    ) -> SyncResult<&mut RealtimeModel> {
        if self.models.contains_key(&model_id) {
            return Err(SyncError::ModelAlreadyOpen(model_id));
        }
        if self
            .offline
            .subscription(&model_id)
            .is_some_and(|sub| sub.pending_local)
        {
            return Err(SyncError::PendingLocalOperations(model_id));
        }

        let mut model = RealtimeModel::open(
            self.context.clone(),
            self.session_id.clone(),
            model_id.clone(),
            resource_id.clone(),
            version,
            data,
            permissions,
        );
        model.set_keep_open(self.config.resync.reopen_after_resync);
        if self.offline.is_subscribed(&model_id) {
            model.set_offline_subscribed(true)?;
            self.offline.mark_open(&model_id);
        }
        tracing::info!("Opened model {} as {} at version {}", model_id, resource_id, version);
        self.resources.insert(resource_id, model_id.clone());
        Ok(self.models.entry(model_id).or_insert(model))
    }

    /// Open an offline-subscribed model from the log. When connected the
    /// model starts resyncing right away.
    pub async fn open_offline(&mut self, model_id: ModelId) -> SyncResult<&mut RealtimeModel> {
        if self.models.contains_key(&model_id) {
            if self.closing_after_resync.remove(&model_id).is_none() {
                return Err(SyncError::ModelAlreadyOpen(model_id));
            }
            let reopen = self.config.resync.reopen_after_resync;
            let model = self
                .models
                .get_mut(&model_id)
                .ok_or_else(|| SyncError::ModelNotOpen(model_id.clone()))?;
            model.set_keep_open(reopen);
            return Ok(model);
        }

        let mut model = self.rehydrate(&model_id).await?;
        model.set_keep_open(self.config.resync.reopen_after_resync);
        self.offline.mark_open(&model_id);
        if self.connected {
            model.on_reconnected(self.session_id.clone())?;
        }
        Ok(self.models.entry(model_id).or_insert(model))
    }

    async fn rehydrate(&self, model_id: &ModelId) -> SyncResult<RealtimeModel> {
        let not_found = || SyncError::from(LogError::ModelNotFound(model_id.clone()));
        if !self.offline.is_subscribed(model_id) {
            return Err(not_found());
        }
        let log = self.log().ok_or_else(not_found)?;
        let snapshot = log.read_snapshot(model_id).await?.ok_or_else(not_found)?;
        RealtimeModel::rehydrate(
            self.context.clone(),
            self.session_id.clone(),
            model_id.clone(),
            &snapshot,
        )
    }

    /// Close a model. Offline models keep their logged local operations.
    pub fn close_model(&mut self, model_id: &ModelId) -> SyncResult<()> {
        if !self.is_open(model_id) {
            return Err(SyncError::ModelNotOpen(model_id.clone()));
        }
        self.remove_model(model_id, true);
        Ok(())
    }

    fn remove_model(&mut self, model_id: &ModelId, report: bool) {
        let Some(mut model) = self.models.remove(model_id) else {
            return;
        };
        self.resources.retain(|_, id| id != model_id);
        self.closing_after_resync.remove(model_id);
        let pending_local = model.has_pending_local();
        let version = model.version();
        model.close();
        self.offline.mark_closed(model_id, version, pending_local);
        if report {
            for event in model.drain_events() {
                self.events.push_back((model_id.clone(), event));
            }
        }
    }

    // ========== Offline Subscriptions ==========

    pub fn subscribe_offline(&mut self, model_ids: &[ModelId]) {
        for model_id in self.offline.subscribe(model_ids) {
            if let Some(model) = self.models.get_mut(&model_id) {
                match model.set_offline_subscribed(true) {
                    Ok(()) => self.offline.mark_open(&model_id),
                    Err(e) => tracing::warn!("Failed to subscribe model {}: {}", model_id, e),
                }
            }
        }
    }

    pub fn unsubscribe_offline(&mut self, model_ids: &[ModelId]) {
        for model_id in self.offline.unsubscribe(model_ids) {
            if let Some(model) = self.models.get_mut(&model_id) {
                if let Err(e) = model.set_offline_subscribed(false) {
                    tracing::warn!("Failed to unsubscribe model {}: {}", model_id, e);
                }
            }
        }
    }

    // ========== Inbound ==========

    /// Route one server message.
    ///
    /// Errors come from the addressed model; a fatal one has already closed
    /// and removed it.
    pub fn handle_message(&mut self, message: ServerMessage) -> SyncResult<()> {
        if let ServerMessage::ModelUpdated { model_id, change } = message {
            self.offline.handle_model_updated(&model_id, change);
            return Ok(());
        }

        let model_id = match &message {
            ServerMessage::ModelResyncResponse {
                model_id,
                resource_id,
                ..
            } => {
                self.resources.retain(|_, id| id != model_id);
                self.resources.insert(resource_id.clone(), model_id.clone());
                Some(model_id.clone())
            }
            other => other
                .resource_id()
                .and_then(|resource_id| self.resources.get(resource_id))
                .cloned(),
        };
        let Some(model) = model_id.as_ref().and_then(|id| self.models.get_mut(id)) else {
            tracing::debug!("Dropping {} for a model that is not open", message.name());
            return Ok(());
        };

        let pending_before = model.has_pending_local();
        let result = model.handle_message(message);
        if let Some(model_id) = model_id {
            self.after_message(&model_id, pending_before);
        }
        result
    }

    fn after_message(&mut self, model_id: &ModelId, pending_before: bool) {
        let Some(model) = self.models.get_mut(model_id) else {
            return;
        };
        if model.is_closed() {
            let version = model.version();
            let events = model.drain_events();
            self.models.remove(model_id);
            self.resources.retain(|_, id| id != model_id);
            let report = self.closing_after_resync.remove(model_id) != Some(false);
            // Closing dropped the in-flight queue; the log still holds it.
            self.offline.mark_closed(model_id, version, pending_before);
            if report {
                self.events
                    .extend(events.into_iter().map(|event| (model_id.clone(), event)));
            }
            return;
        }

        let finished = model.connection_state() == ConnectionState::Online
            && !model.has_pending_local();
        if finished {
            if let Some(&report) = self.closing_after_resync.get(model_id) {
                tracing::info!("Background resync of model {} finished", model_id);
                self.remove_model(model_id, report);
            }
        }
    }

    // ========== Connection ==========

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        for (model_id, model) in &mut self.models {
            if let Err(e) = model.on_disconnected() {
                tracing::warn!("Failed to take model {} offline: {}", model_id, e);
            }
        }
    }

    /// Resume on a new connection session.
    ///
    /// Re-sends the offline subscription set, starts resyncing every open
    /// model and rehydrates closed offline models with local edits.
    pub async fn on_reconnected(&mut self, session_id: SessionId) {
        self.session_id = session_id;
        self.connected = true;
        self.offline.reconcile();

        if !self.config.resync.reopen_after_resync {
            for model_id in self.models.keys() {
                self.closing_after_resync.entry(model_id.clone()).or_insert(true);
            }
        }
        for (model_id, model) in &mut self.models {
            if let Err(e) = model.on_reconnected(self.session_id.clone()) {
                tracing::warn!("Failed to resync model {}: {}", model_id, e);
            }
        }

        self.resync_offline_models().await;
    }

    /// Rehydrate closed offline models that hold local edits and resync them
    /// without reopening them on the server. Returns how many were started.
    pub async fn resync_offline_models(&mut self) -> usize {
        let mut started = 0;
        for model_id in self.offline.closed_with_pending_local() {
            if self.models.contains_key(&model_id) {
                continue;
            }
            let mut model = match self.rehydrate(&model_id).await {
                Ok(model) => model,
                Err(e) => {
                    tracing::warn!("Cannot resync offline model {}: {}", model_id, e);
                    continue;
                }
            };
            model.set_keep_open(false);
            if self.connected {
                if let Err(e) = model.on_reconnected(self.session_id.clone()) {
                    tracing::warn!("Cannot resync offline model {}: {}", model_id, e);
                    continue;
                }
            }
            tracing::debug!("Resyncing closed offline model {}", model_id);
            self.offline.mark_open(&model_id);
            self.closing_after_resync.insert(model_id.clone(), false);
            self.models.insert(model_id, model);
            started += 1;
        }
        started
    }

    // ========== Log Completions ==========

    /// Drain finished log commands without waiting.
    pub fn poll_log_completions(&mut self) -> Vec<LogCompletion> {
        let mut done = Vec::new();
        if let Some(rx) = &mut self.completions {
            while let Ok(completion) = rx.try_recv() {
                done.push(completion);
            }
        }
        done
    }

    /// Wait for the next finished log command. `None` without a log.
    pub async fn next_log_completion(&mut self) -> Option<LogCompletion> {
        match &mut self.completions {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop collecting log completions. Failures are still logged by the
    /// worker.
    pub fn discard_log_completions(&mut self) {
        if self.completions.take().is_some() {
            tracing::debug!("Discarding log completions");
        }
    }
}
