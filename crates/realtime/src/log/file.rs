//! File-based operation log.
//!
//! # Directory Structure
//!
//! ```text
//! offline/
//! └── {model_id}/
//!     ├── snapshot.json      # Base version and data
//!     ├── server_ops.jsonl   # Server operations since the base (JSON lines)
//!     └── local_ops.json     # Unacknowledged local operations
//! ```
//!
//! Server operations are appended; the snapshot and the local operations are
//! rewritten through a temp file and an atomic rename.

use super::{LogError, LogResult, ModelSnapshot, OperationLog};
use crate::event::{ClientOperationEvent, ServerOperationEvent, SessionId};
use model_tree::{DataValue, ModelId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SNAPSHOT_FILE: &str = "snapshot.json";
const SERVER_OPS_FILE: &str = "server_ops.jsonl";
const LOCAL_OPS_FILE: &str = "local_ops.json";

#[derive(Serialize, Deserialize)]
struct BaseSnapshot {
    base_version: u64,
    base_data: DataValue,
}

/// Operation log stored as one directory per model
pub struct FileOperationLog {
    /// Base directory for all model data
    base_path: PathBuf,
    /// Serializes every read-modify-write
    lock: Mutex<()>,
}

impl FileOperationLog {
    /// Open a log rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: impl AsRef<Path>) -> LogResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn guard(&self) -> LogResult<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| LogError::LockPoisoned)
    }

    fn model_path(&self, model_id: &ModelId) -> LogResult<PathBuf> {
        let id = model_id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(|c| c == '/' || c == '\\') {
            return Err(LogError::InvalidModelId(model_id.clone()));
        }
        Ok(self.base_path.join(id))
    }

    /// Directory of a model that already has a snapshot.
    fn existing_model_path(&self, model_id: &ModelId) -> LogResult<PathBuf> {
        let path = self.model_path(model_id)?;
        if !path.join(SNAPSHOT_FILE).exists() {
            return Err(LogError::ModelNotFound(model_id.clone()));
        }
        Ok(path)
    }

    fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> LogResult<()> {
        let temp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    fn read_local_ops(dir: &Path) -> LogResult<Vec<ClientOperationEvent>> {
        let path = dir.join(LOCAL_OPS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn write_local_ops(dir: &Path, ops: &[ClientOperationEvent]) -> LogResult<()> {
        Self::write_json_atomic(&dir.join(LOCAL_OPS_FILE), ops)
    }

    fn read_server_ops(dir: &Path) -> LogResult<Vec<ServerOperationEvent>> {
        let path = dir.join(SERVER_OPS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut ops = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ServerOperationEvent = serde_json::from_str(&line).map_err(|e| {
                LogError::Serialization(format!("Failed to parse server operation: {}", e))
            })?;
            ops.push(event);
        }
        Ok(ops)
    }

    fn append_server_op(dir: &Path, event: &ServerOperationEvent) -> LogResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SERVER_OPS_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, event)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

impl OperationLog for FileOperationLog {
    fn write_snapshot(&self, model_id: &ModelId, version: u64, data: &DataValue) -> LogResult<()> {
        let _guard = self.guard()?;
        let dir = self.model_path(model_id)?;
        fs::create_dir_all(&dir)?;
        let base = BaseSnapshot {
            base_version: version,
            base_data: data.clone(),
        };
        Self::write_json_atomic(&dir.join(SNAPSHOT_FILE), &base)?;
        let server_ops = dir.join(SERVER_OPS_FILE);
        if server_ops.exists() {
            fs::remove_file(server_ops)?;
        }
        Ok(())
    }

    fn read_snapshot(&self, model_id: &ModelId) -> LogResult<Option<ModelSnapshot>> {
        let _guard = self.guard()?;
        let dir = self.model_path(model_id)?;
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if !snapshot_path.exists() {
            return Ok(None);
        }
        let base: BaseSnapshot = serde_json::from_reader(BufReader::new(File::open(snapshot_path)?))?;
        Ok(Some(ModelSnapshot {
            base_version: base.base_version,
            base_data: base.base_data,
            server_ops: Self::read_server_ops(&dir)?,
            local_ops: Self::read_local_ops(&dir)?,
        }))
    }

    fn append_local_operation(
        &self,
        model_id: &ModelId,
        event: &ClientOperationEvent,
    ) -> LogResult<()> {
        let _guard = self.guard()?;
        let dir = self.existing_model_path(model_id)?;
        let mut ops = Self::read_local_ops(&dir)?;
        ops.push(event.clone());
        Self::write_local_ops(&dir, &ops)
    }

    fn append_server_operation(
        &self,
        model_id: &ModelId,
        event: &ServerOperationEvent,
        still_in_flight: &[ClientOperationEvent],
    ) -> LogResult<()> {
        let _guard = self.guard()?;
        let dir = self.existing_model_path(model_id)?;
        Self::append_server_op(&dir, event)?;
        Self::write_local_ops(&dir, still_in_flight)
    }

    fn acknowledge_local_operation(
        &self,
        model_id: &ModelId,
        session_id: &SessionId,
        seq_no: u64,
        event: &ServerOperationEvent,
    ) -> LogResult<()> {
        let _guard = self.guard()?;
        let dir = self.existing_model_path(model_id)?;
        let mut ops = Self::read_local_ops(&dir)?;
        let position = ops
            .iter()
            .position(|op| op.seq_no == seq_no && &op.session_id == session_id)
            .ok_or_else(|| LogError::LocalOperationNotFound {
                model_id: model_id.clone(),
                session_id: session_id.clone(),
                seq_no,
            })?;
        ops.remove(position);
        Self::append_server_op(&dir, event)?;
        Self::write_local_ops(&dir, &ops)
    }

    fn replace_local_operations(
        &self,
        model_id: &ModelId,
        in_flight: &[ClientOperationEvent],
    ) -> LogResult<()> {
        let _guard = self.guard()?;
        let dir = self.existing_model_path(model_id)?;
        Self::write_local_ops(&dir, in_flight)
    }

    fn delete_model(&self, model_id: &ModelId) -> LogResult<()> {
        let _guard = self.guard()?;
        let dir = self.model_path(model_id)?;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn model_ids(&self) -> LogResult<Vec<ModelId>> {
        let _guard = self.guard()?;
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(SNAPSHOT_FILE).exists() {
                ids.push(ModelId::new(entry.file_name().to_string_lossy()));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_backend() {
        let dir = TempDir::new().unwrap();
        exercise_backend(&FileOperationLog::new(dir.path()).unwrap());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = FileOperationLog::new(dir.path()).unwrap();
            log.write_snapshot(&model(), 2, &base_data()).unwrap();
            log.append_local_operation(&model(), &local(0, 2, push(1, "x")))
                .unwrap();
            let shifted = [local(0, 2, push(2, "x"))];
            log.append_server_operation(&model(), &server(2, push(0, "s")), &shifted)
                .unwrap();
        }

        let log = FileOperationLog::new(dir.path()).unwrap();
        let snapshot = log.read_snapshot(&model()).unwrap().unwrap();
        assert_eq!(snapshot.base_version, 2);
        assert_eq!(snapshot.server_ops.len(), 1);
        assert_eq!(snapshot.server_ops[0].operation, push(0, "s"));
        assert_eq!(snapshot.local_ops[0].operation, push(2, "x"));
        assert_eq!(snapshot.server_version(), 3);
        assert_eq!(log.model_ids().unwrap(), vec![model()]);
    }

    #[test]
    fn test_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let log = FileOperationLog::new(dir.path()).unwrap();
        log.write_snapshot(&model(), 0, &base_data()).unwrap();
        log.append_server_operation(&model(), &server(0, push(0, "s")), &[])
            .unwrap();

        let model_dir = dir.path().join("doc-1");
        assert!(model_dir.join(SNAPSHOT_FILE).exists());
        assert!(model_dir.join(LOCAL_OPS_FILE).exists());
        let lines = fs::read_to_string(model_dir.join(SERVER_OPS_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[test]
    fn test_rejects_path_like_model_ids() {
        let dir = TempDir::new().unwrap();
        let log = FileOperationLog::new(dir.path()).unwrap();
        let bad = ModelId::new("../escape");
        assert_eq!(
            log.write_snapshot(&bad, 0, &base_data()),
            Err(LogError::InvalidModelId(bad))
        );
    }

    #[test]
    fn test_corrupt_server_log_is_reported() {
        let dir = TempDir::new().unwrap();
        let log = FileOperationLog::new(dir.path()).unwrap();
        log.write_snapshot(&model(), 0, &base_data()).unwrap();
        fs::write(dir.path().join("doc-1").join(SERVER_OPS_FILE), "not json\n").unwrap();
        assert!(matches!(
            log.read_snapshot(&model()),
            Err(LogError::Serialization(_))
        ));
    }
}
