//! Client-side synchronization core for real-time collaborative models.
//!
//! Several clients edit the same [`model_tree`] document at once. Each client
//! applies its own edits immediately, sends them to the server and transforms
//! concurrent edits it receives back, so every participant converges on the
//! same document. Connections may drop; edits made offline are kept (and
//! optionally persisted) and replayed once the client has caught up.
//!
//! # Modules
//!
//! - `operation`: Discrete and compound operations with exact inverses
//! - `reference`: Cursor and selection adjustment through edits
//! - `transform`: Pairwise operation transformation registry
//! - `concurrency`: Sequencing of local and remote operations for one model
//! - `resync`: Online/offline/resyncing state machine for one model
//! - `offline`: Offline subscription table
//! - `log`: Persistent operation log and its background worker
//! - `message`: Logical client/server messages
//! - `model`: Owner of one open model
//! - `service`: Message routing across models
//! - `config`: Client configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```
//! use model_tree::{DataValue, ModelTree, NodeId, Value};
//! use realtime::operation::{DiscreteOperation, Operation};
//! use realtime::TransformEngine;
//!
//! let text = NodeId::from_u128(1);
//! let base = ModelTree::new(DataValue::with_id(text, Value::String("ac".into())));
//!
//! // Two clients insert at the same position concurrently.
//! let server: Operation = DiscreteOperation::string_insert(text, 1, "x").into();
//! let client: Operation = DiscreteOperation::string_insert(text, 1, "y").into();
//!
//! let engine = TransformEngine::new();
//! let (server_t, client_t) = engine.transform(&server, &client).unwrap();
//!
//! let mut a = base.clone();
//! server.apply(&mut a).unwrap();
//! client_t.apply(&mut a).unwrap();
//!
//! let mut b = base;
//! client.apply(&mut b).unwrap();
//! server_t.apply(&mut b).unwrap();
//!
//! assert_eq!(a, b);
//! assert_eq!(a.root().value, Value::String("axyc".into()));
//! ```

mod apply;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod message;
pub mod model;
pub mod offline;
pub mod operation;
pub mod reference;
pub mod resync;
pub mod service;
pub mod transform;

pub use concurrency::{CommitState, ConcurrencyControl};
pub use config::{ClientConfig, ConfigError, OfflineConfig, ResyncConfig};
pub use error::{ConcurrencyError, ResyncError, SyncError, SyncResult, TransformError};
pub use event::{ClientOperationEvent, ResourceId, ServerOperationEvent, SessionId};
pub use log::{
    FileOperationLog, LogCommand, LogError, LogHandle, LogResult, MemoryOperationLog,
    ModelSnapshot, OperationLog,
};
pub use message::{ClientMessage, ModelChange, ModelPermissions, RemoteReference, ServerMessage};
pub use model::{ModelContext, ModelEvent, RealtimeModel};
pub use offline::{OfflineManager, OfflineSubscription};
pub use operation::{DiscreteOperation, Operation, OperationKind, OperationType};
pub use reference::{ReferenceData, ReferenceTransformer, ReferenceType, ReferenceValues};
pub use resync::{ConnectionState, ResyncController};
pub use service::ModelService;
pub use transform::TransformEngine;
