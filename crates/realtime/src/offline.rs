//! Offline subscription management.
//!
//! Tracks which models the user wants available offline, the last version the
//! client synchronized for each, and whether the model is currently open.
//! Open models keep their own log up to date through their resync
//! controller. For closed models this manager applies the server's "model
//! updated" notices straight to the log.

use crate::log::{LogCommand, LogHandle};
use crate::message::{ClientMessage, ModelChange};
use model_tree::ModelId;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Offline state of one subscribed model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfflineSubscription {
    /// Last server version written to the log
    pub version: u64,
    /// Whether a live model currently owns the log entry
    pub open: bool,
    /// Whether the log holds unacknowledged local operations
    pub pending_local: bool,
}

/// Process-wide table of offline-subscribed models
pub struct OfflineManager {
    subscriptions: BTreeMap<ModelId, OfflineSubscription>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    log: Option<LogHandle>,
}

impl OfflineManager {
    pub fn new(outbox: mpsc::UnboundedSender<ClientMessage>, log: Option<LogHandle>) -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            outbox,
            log,
        }
    }

    pub fn is_subscribed(&self, model_id: &ModelId) -> bool {
        self.subscriptions.contains_key(model_id)
    }

    pub fn subscription(&self, model_id: &ModelId) -> Option<&OfflineSubscription> {
        self.subscriptions.get(model_id)
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Closed models whose log still holds local edits the server never saw.
    pub fn closed_with_pending_local(&self) -> Vec<ModelId> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| !sub.open && sub.pending_local)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Re-register a subscription found in the log at startup. Nothing is sent.
    pub fn restore(&mut self, model_id: ModelId, version: u64, pending_local: bool) {
        self.subscriptions.insert(
            model_id,
            OfflineSubscription {
                version,
                open: false,
                pending_local,
            },
        );
    }

    // ========== Subscription Changes ==========

    /// Subscribe models and tell the server. Returns the ids that were new.
    pub fn subscribe(&mut self, model_ids: &[ModelId]) -> Vec<ModelId> {
        let mut added = Vec::new();
        for id in model_ids {
            if !self.subscriptions.contains_key(id) && !added.contains(id) {
                self.subscriptions.insert(
                    id.clone(),
                    OfflineSubscription {
                        version: 0,
                        open: false,
                        pending_local: false,
                    },
                );
                added.push(id.clone());
            }
        }
        if !added.is_empty() {
            self.send_change(added.clone(), Vec::new(), None);
        }
        added
    }

    /// Unsubscribe models, purging the log of the closed ones. Returns the
    /// ids that were subscribed.
    pub fn unsubscribe(&mut self, model_ids: &[ModelId]) -> Vec<ModelId> {
        let mut removed = Vec::new();
        for id in model_ids {
            if let Some(sub) = self.subscriptions.remove(id) {
                if !sub.open {
                    self.submit(LogCommand::Delete {
                        model_id: id.clone(),
                    });
                }
                removed.push(id.clone());
            }
        }
        if !removed.is_empty() {
            self.send_change(Vec::new(), removed.clone(), None);
        }
        removed
    }

    /// Send the whole set as a replacement, e.g. after reconnecting.
    pub fn reconcile(&mut self) {
        self.send_change(Vec::new(), Vec::new(), Some(self.model_ids()));
    }

    fn send_change(&self, added: Vec<ModelId>, removed: Vec<ModelId>, all: Option<Vec<ModelId>>) {
        let message = ClientMessage::OfflineSubscriptionChange {
            added,
            removed,
            all,
        };
        if self.outbox.send(message).is_err() {
            tracing::warn!("Failed to send offline subscription change: transport closed");
        }
    }

    fn submit(&self, command: LogCommand) {
        if let Some(log) = &self.log {
            if let Err(e) = log.submit(command) {
                tracing::warn!("Failed to queue offline log command: {}", e);
            }
        }
    }

    // ========== Model Lifecycle ==========

    pub fn mark_open(&mut self, model_id: &ModelId) {
        if let Some(sub) = self.subscriptions.get_mut(model_id) {
            sub.open = true;
        }
    }

    /// Hand the log entry back after the live model closed.
    pub fn mark_closed(&mut self, model_id: &ModelId, version: u64, pending_local: bool) {
        if let Some(sub) = self.subscriptions.get_mut(model_id) {
            sub.open = false;
            sub.version = version;
            sub.pending_local = pending_local;
        }
    }

    /// Apply a server notice about a closed model to the log.
    pub fn handle_model_updated(&mut self, model_id: &ModelId, change: ModelChange) {
        let Some(sub) = self.subscriptions.get_mut(model_id) else {
            tracing::debug!("Ignoring update for unsubscribed model {}", model_id);
            return;
        };
        if sub.open {
            return;
        }
        match change {
            ModelChange::Deleted | ModelChange::PermissionRevoked => {
                tracing::info!("Purging offline copy of model {}", model_id);
                self.subscriptions.remove(model_id);
                self.submit(LogCommand::Delete {
                    model_id: model_id.clone(),
                });
            }
            ModelChange::DataUpdated { version, data } => {
                if sub.pending_local {
                    tracing::debug!(
                        "Keeping offline copy of model {}: local operations pending",
                        model_id
                    );
                    return;
                }
                sub.version = version;
                self.submit(LogCommand::WriteSnapshot {
                    model_id: model_id.clone(),
                    version,
                    data,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{spawn_log_worker, MemoryOperationLog, OperationLog};
    use model_tree::DataValue;
    use std::sync::Arc;

    fn id(s: &str) -> ModelId {
        ModelId::new(s)
    }

    fn make_manager() -> (OfflineManager, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OfflineManager::new(tx, None), rx)
    }

    #[test]
    fn test_subscribe_sends_only_new_ids() {
        let (mut manager, mut rx) = make_manager();
        assert_eq!(manager.subscribe(&[id("a"), id("b"), id("a")]), vec![id("a"), id("b")]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::OfflineSubscriptionChange {
                added: vec![id("a"), id("b")],
                removed: Vec::new(),
                all: None,
            }
        );

        assert!(manager.subscribe(&[id("a")]).is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_and_reconcile() {
        let (mut manager, mut rx) = make_manager();
        manager.subscribe(&[id("a"), id("b")]);
        rx.try_recv().unwrap();

        assert_eq!(manager.unsubscribe(&[id("b"), id("zz")]), vec![id("b")]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::OfflineSubscriptionChange {
                added: Vec::new(),
                removed: vec![id("b")],
                all: None,
            }
        );

        manager.reconcile();
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::OfflineSubscriptionChange {
                added: Vec::new(),
                removed: Vec::new(),
                all: Some(vec![id("a")]),
            }
        );
    }

    #[test]
    fn test_send_failure_keeps_subscription() {
        let (mut manager, rx) = make_manager();
        drop(rx);
        manager.subscribe(&[id("a")]);
        assert!(manager.is_subscribed(&id("a")));
    }

    #[test]
    fn test_pending_local_tracking() {
        let (mut manager, _rx) = make_manager();
        manager.restore(id("a"), 4, true);
        manager.restore(id("b"), 2, false);
        assert_eq!(manager.closed_with_pending_local(), vec![id("a")]);

        manager.mark_open(&id("a"));
        assert!(manager.closed_with_pending_local().is_empty());
        manager.mark_closed(&id("a"), 9, false);
        assert_eq!(
            manager.subscription(&id("a")),
            Some(&OfflineSubscription {
                version: 9,
                open: false,
                pending_local: false,
            })
        );
    }

    #[tokio::test]
    async fn test_model_updates_reach_the_log() {
        let backend = Arc::new(MemoryOperationLog::new());
        let (log, mut done, _join) = spawn_log_worker(backend.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = OfflineManager::new(tx, Some(log));
        for name in ["fresh", "dirty", "gone", "open"] {
            backend.write_snapshot(&id(name), 1, &DataValue::null()).unwrap();
        }
        manager.restore(id("fresh"), 1, false);
        manager.restore(id("dirty"), 1, true);
        manager.restore(id("gone"), 1, false);
        manager.restore(id("open"), 1, false);
        manager.mark_open(&id("open"));

        let data = DataValue::string("new");
        manager.handle_model_updated(
            &id("fresh"),
            ModelChange::DataUpdated {
                version: 5,
                data: data.clone(),
            },
        );
        manager.handle_model_updated(
            &id("dirty"),
            ModelChange::DataUpdated {
                version: 5,
                data: data.clone(),
            },
        );
        manager.handle_model_updated(&id("gone"), ModelChange::PermissionRevoked);
        manager.handle_model_updated(&id("open"), ModelChange::Deleted);

        // Two commands: the snapshot for "fresh" and the purge of "gone".
        done.recv().await.unwrap();
        done.recv().await.unwrap();

        let fresh = backend.read_snapshot(&id("fresh")).unwrap().unwrap();
        assert_eq!((fresh.base_version, fresh.base_data), (5, data));
        assert_eq!(backend.read_snapshot(&id("dirty")).unwrap().unwrap().base_version, 1);
        assert_eq!(backend.read_snapshot(&id("gone")).unwrap(), None);
        assert!(backend.read_snapshot(&id("open")).unwrap().is_some());

        assert_eq!(manager.subscription(&id("fresh")).unwrap().version, 5);
        assert!(!manager.is_subscribed(&id("gone")));
        assert!(manager.is_subscribed(&id("open")));
    }
}
