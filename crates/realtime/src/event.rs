//! Identifiers and versioned operation events exchanged with the server.

use crate::operation::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one client connection session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random session id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-level handle of an open model. A new one is issued every time a
/// model is (re)opened on a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A locally originated operation, stamped with the version it was created
/// against and a strictly increasing local sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientOperationEvent {
    pub session_id: SessionId,
    pub seq_no: u64,
    pub context_version: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
}

/// An operation the server has placed in its total order at `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerOperationEvent {
    /// Session that originated the operation
    pub session_id: SessionId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
}

impl ServerOperationEvent {
    pub fn new(session_id: SessionId, version: u64, operation: Operation) -> Self {
        Self {
            session_id,
            version,
            timestamp: Utc::now(),
            operation,
        }
    }
}
