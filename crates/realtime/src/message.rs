//! Logical messages exchanged with the sync server.
//!
//! The physical encoding belongs to the transport. These are plain serde
//! types tagged by `type`; JSON is what the tests use.

use crate::event::{ResourceId, SessionId};
use crate::operation::Operation;
use crate::reference::ReferenceValues;
use chrono::{DateTime, Utc};
use model_tree::{DataValue, ModelId, NodeId};
use serde::{Deserialize, Serialize};

/// Access the server grants on a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPermissions {
    pub read: bool,
    pub write: bool,
    pub remove: bool,
    pub manage: bool,
}

impl ModelPermissions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            remove: false,
            manage: false,
        }
    }

    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            remove: true,
            manage: true,
        }
    }
}

impl Default for ModelPermissions {
    fn default() -> Self {
        Self::all()
    }
}

/// Body shared by the four outgoing reference messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceMessage {
    pub resource_id: ResourceId,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ReferenceValues>,
    pub version: u64,
}

/// A reference owned by another session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReference {
    pub session_id: SessionId,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ReferenceValues>,
}

/// What happened to a closed, offline-subscribed model on the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelChange {
    Deleted,
    PermissionRevoked,
    DataUpdated { version: u64, data: DataValue },
}

/// Messages sent from client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit one local operation.
    OperationSubmission {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        #[serde(rename = "sequenceNumber")]
        sequence_number: u64,
        #[serde(rename = "contextVersion")]
        context_version: u64,
        operation: Operation,
    },

    /// Ask to rejoin a model after reconnecting.
    ModelResyncRequest {
        #[serde(rename = "modelId")]
        model_id: ModelId,
        #[serde(rename = "contextVersion")]
        context_version: u64,
    },

    /// Resync finished; `open` tells the server whether to keep the model open.
    ModelResyncCompleteRequest {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        open: bool,
    },

    ShareReference(ReferenceMessage),
    SetReference(ReferenceMessage),
    ClearReference(ReferenceMessage),
    UnshareReference(ReferenceMessage),

    /// Change the offline subscription set. `all` replaces the whole set.
    OfflineSubscriptionChange {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        added: Vec<ModelId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed: Vec<ModelId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        all: Option<Vec<ModelId>>,
    },
}

/// Messages sent from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An operation placed in the server order by some session.
    RemoteOperation {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "contextVersion")]
        version: u64,
        timestamp: DateTime<Utc>,
        operation: Operation,
    },

    /// One of our operations was placed at `version`.
    OperationAcknowledgement {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        version: u64,
        #[serde(rename = "sequenceNumber")]
        sequence_number: u64,
        timestamp: DateTime<Utc>,
    },

    /// Reply to a resync request.
    ModelResyncResponse {
        #[serde(rename = "modelId")]
        model_id: ModelId,
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        #[serde(rename = "currentVersion")]
        current_version: u64,
        permissions: ModelPermissions,
    },

    ModelResyncCompleteResponse {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        #[serde(rename = "connectedClients")]
        connected_clients: Vec<SessionId>,
        references: Vec<RemoteReference>,
    },

    RemoteReferenceShared {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        reference: RemoteReference,
    },

    RemoteReferenceSet {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        reference: RemoteReference,
    },

    RemoteReferenceCleared {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        key: String,
    },

    RemoteReferenceUnshared {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        key: String,
    },

    /// Notice about a closed, offline-subscribed model.
    ModelUpdated {
        #[serde(rename = "modelId")]
        model_id: ModelId,
        change: ModelChange,
    },

    /// The server closed the model.
    ModelForceClose {
        #[serde(rename = "resourceId")]
        resource_id: ResourceId,
        reason: String,
    },
}

impl ServerMessage {
    /// Resource the message is addressed to, if it targets an open model.
    pub fn resource_id(&self) -> Option<&ResourceId> {
        match self {
            ServerMessage::RemoteOperation { resource_id, .. }
            | ServerMessage::OperationAcknowledgement { resource_id, .. }
            | ServerMessage::ModelResyncResponse { resource_id, .. }
            | ServerMessage::ModelResyncCompleteResponse { resource_id, .. }
            | ServerMessage::RemoteReferenceShared { resource_id, .. }
            | ServerMessage::RemoteReferenceSet { resource_id, .. }
            | ServerMessage::RemoteReferenceCleared { resource_id, .. }
            | ServerMessage::RemoteReferenceUnshared { resource_id, .. }
            | ServerMessage::ModelForceClose { resource_id, .. } => Some(resource_id),
            ServerMessage::ModelUpdated { .. } => None,
        }
    }

    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::RemoteOperation { .. } => "remote operation",
            ServerMessage::OperationAcknowledgement { .. } => "operation acknowledgement",
            ServerMessage::ModelResyncResponse { .. } => "resync response",
            ServerMessage::ModelResyncCompleteResponse { .. } => "resync complete response",
            ServerMessage::RemoteReferenceShared { .. } => "reference shared",
            ServerMessage::RemoteReferenceSet { .. } => "reference set",
            ServerMessage::RemoteReferenceCleared { .. } => "reference cleared",
            ServerMessage::RemoteReferenceUnshared { .. } => "reference unshared",
            ServerMessage::ModelUpdated { .. } => "model updated",
            ServerMessage::ModelForceClose { .. } => "force close",
        }
    }

    /// Parse a JSON-encoded server message.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::DiscreteOperation;

    #[test]
    fn test_operation_submission_serialization() {
        let msg = ClientMessage::OperationSubmission {
            resource_id: ResourceId::from("r1"),
            sequence_number: 3,
            context_version: 10,
            operation: DiscreteOperation::number_delta(NodeId::from_u128(1), 2.0).into(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"operation_submission\""));
        assert!(json.contains("\"sequenceNumber\":3"));
        assert!(json.contains("\"contextVersion\":10"));
    }

    #[test]
    fn test_reference_message_serialization() {
        let msg = ClientMessage::SetReference(ReferenceMessage {
            resource_id: ResourceId::from("r1"),
            key: "cursor".into(),
            value_id: Some(NodeId::from_u128(4)),
            references: Some(ReferenceValues::Index(vec![2])),
            version: 7,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "set_reference");
        assert_eq!(value["key"], "cursor");
        assert_eq!(value["references"]["values"][0], 2);
        let back: ClientMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_subscription_change_omits_empty_parts() {
        let msg = ClientMessage::OfflineSubscriptionChange {
            added: vec![ModelId::new("a")],
            removed: Vec::new(),
            all: None,
        };
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"offline_subscription_change","added":["a"]}"#
        );
    }

    #[test]
    fn test_acknowledgement_deserialization() {
        let json = r#"{"type":"operation_acknowledgement","resourceId":"r9","version":12,"sequenceNumber":0,"timestamp":"2024-05-01T10:00:00Z"}"#;
        let msg = ServerMessage::from_json(json).unwrap();
        assert_eq!(msg.resource_id(), Some(&ResourceId::from("r9")));
        match msg {
            ServerMessage::OperationAcknowledgement {
                version,
                sequence_number,
                ..
            } => assert_eq!((version, sequence_number), (12, 0)),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_model_updated_has_no_resource() {
        let json = r#"{"type":"model_updated","modelId":"m1","change":{"kind":"deleted"}}"#;
        let msg = ServerMessage::from_json(json).unwrap();
        assert_eq!(msg.resource_id(), None);
        assert_eq!(
            msg,
            ServerMessage::ModelUpdated {
                model_id: ModelId::new("m1"),
                change: ModelChange::Deleted,
            }
        );
    }
}
