//! In-memory operation log.
//!
//! Useful for tests and for clients that only need offline data for the
//! lifetime of the process.

use super::{LogError, LogResult, ModelSnapshot, OperationLog};
use crate::event::{ClientOperationEvent, ServerOperationEvent, SessionId};
use model_tree::{DataValue, ModelId};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Operation log kept in a map guarded by a `RwLock`
#[derive(Default)]
pub struct MemoryOperationLog {
    models: RwLock<HashMap<ModelId, ModelSnapshot>>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> LogResult<RwLockReadGuard<'_, HashMap<ModelId, ModelSnapshot>>> {
        self.models.read().map_err(|_| LogError::LockPoisoned)
    }

    fn write(&self) -> LogResult<RwLockWriteGuard<'_, HashMap<ModelId, ModelSnapshot>>> {
        self.models.write().map_err(|_| LogError::LockPoisoned)
    }

    /// Run `f` on an existing model entry.
    fn update<T>(
        &self,
        model_id: &ModelId,
        f: impl FnOnce(&mut ModelSnapshot) -> LogResult<T>,
    ) -> LogResult<T> {
        let mut models = self.write()?;
        let snapshot = models
            .get_mut(model_id)
            .ok_or_else(|| LogError::ModelNotFound(model_id.clone()))?;
        f(snapshot)
    }
}

impl OperationLog for MemoryOperationLog {
    fn write_snapshot(&self, model_id: &ModelId, version: u64, data: &DataValue) -> LogResult<()> {
        let mut models = self.write()?;
        let local_ops = models
            .remove(model_id)
            .map(|old| old.local_ops)
            .unwrap_or_default();
        let mut snapshot = ModelSnapshot::new(version, data.clone());
        snapshot.local_ops = local_ops;
        models.insert(model_id.clone(), snapshot);
        Ok(())
    }

    fn read_snapshot(&self, model_id: &ModelId) -> LogResult<Option<ModelSnapshot>> {
        Ok(self.read()?.get(model_id).cloned())
    }

    fn append_local_operation(
        &self,
        model_id: &ModelId,
        event: &ClientOperationEvent,
    ) -> LogResult<()> {
        self.update(model_id, |snapshot| {
            snapshot.local_ops.push(event.clone());
            Ok(())
        })
    }

    fn append_server_operation(
        &self,
        model_id: &ModelId,
        event: &ServerOperationEvent,
        still_in_flight: &[ClientOperationEvent],
    ) -> LogResult<()> {
        self.update(model_id, |snapshot| {
            snapshot.server_ops.push(event.clone());
            snapshot.local_ops = still_in_flight.to_vec();
            Ok(())
        })
    }

    fn acknowledge_local_operation(
        &self,
        model_id: &ModelId,
        session_id: &SessionId,
        seq_no: u64,
        event: &ServerOperationEvent,
    ) -> LogResult<()> {
        self.update(model_id, |snapshot| {
            let position = snapshot
                .local_ops
                .iter()
                .position(|op| op.seq_no == seq_no && &op.session_id == session_id)
                .ok_or_else(|| LogError::LocalOperationNotFound {
                    model_id: model_id.clone(),
                    session_id: session_id.clone(),
                    seq_no,
                })?;
            snapshot.local_ops.remove(position);
            snapshot.server_ops.push(event.clone());
            Ok(())
        })
    }

    fn replace_local_operations(
        &self,
        model_id: &ModelId,
        in_flight: &[ClientOperationEvent],
    ) -> LogResult<()> {
        self.update(model_id, |snapshot| {
            snapshot.local_ops = in_flight.to_vec();
            Ok(())
        })
    }

    fn delete_model(&self, model_id: &ModelId) -> LogResult<()> {
        self.write()?.remove(model_id);
        Ok(())
    }

    fn model_ids(&self) -> LogResult<Vec<ModelId>> {
        let mut ids: Vec<ModelId> = self.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::exercise_backend;
    use super::*;

    #[test]
    fn test_memory_backend() {
        exercise_backend(&MemoryOperationLog::new());
    }
}
