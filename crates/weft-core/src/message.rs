//! Messages carried by the ordered document stream.
//!
//! Every client receives the same [`SequencedMessage`]s in the same order.
//! Clients send [`DocumentMessage`]s through a [`MessageSink`]; the ordering
//! service stamps them with a sequence number and echoes them back to everyone,
//! including the sender.

use crate::tree::SnapshotTree;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Document-wide (or channel-local) sequence number.
pub type SequenceNumber = u64;

/// Kind of a document message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Channel operation wrapped in an [`Envelope`].
    Operation,
    /// A channel becoming shared; contents is an [`AttachMessage`].
    Attach,
    /// Request to persist a snapshot at this point of the stream.
    Save,
    /// A blob was written to storage.
    BlobUploaded,
    /// Leader asking an external agent to take over tasks.
    RemoteHelp,
}

/// Connectivity of the local client to the ordering service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Where a message forwarded from another container came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOrigin {
    /// Id of the originating container.
    pub id: String,
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
}

/// Routing wrapper for channel operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Id of the target channel.
    pub address: String,
    pub contents: Value,
}

impl Envelope {
    pub fn new(address: impl Into<String>, contents: Value) -> Self {
        Self {
            address: address.into(),
            contents,
        }
    }
}

/// Broadcast announcing a previously local channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub snapshot: SnapshotTree,
}

/// Tasks the leader could not place on a connected client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHelpMessage {
    pub tasks: Vec<String>,
    pub version: Option<String>,
}

/// A message as sent by a client, before sequencing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    pub client_sequence_number: SequenceNumber,
    /// Last sequence number the client had processed when it sent this.
    pub reference_sequence_number: SequenceNumber,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub contents: Value,
}

/// A message as delivered by the ordering service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    /// Sending client; `None` for service-generated messages.
    pub client_id: Option<String>,
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
    pub client_sequence_number: SequenceNumber,
    pub reference_sequence_number: SequenceNumber,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub contents: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<MessageOrigin>,
    /// Milliseconds since the epoch, as stamped by the ordering service.
    #[serde(default)]
    pub timestamp: u64,
}

impl SequencedMessage {
    /// Decode the contents of an `Operation` message.
    pub fn envelope(&self) -> Result<Envelope, serde_json::Error> {
        serde_json::from_value(self.contents.clone())
    }

    /// Decode the contents of an `Attach` message.
    pub fn attach(&self) -> Result<AttachMessage, serde_json::Error> {
        serde_json::from_value(self.contents.clone())
    }

    /// Whether `client_id` sent this message on this container.
    pub fn is_from(&self, client_id: Option<&str>) -> bool {
        self.origin.is_none() && client_id.is_some() && self.client_id.as_deref() == client_id
    }
}

/// Errors raised when handing a message to the ordering service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("not connected to the ordering service")]
    Disconnected,

    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Outbound half of the ordering service.
pub trait MessageSink: Send + Sync {
    fn submit(&self, message: DocumentMessage) -> Result<(), SubmitError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sequenced(client_id: Option<&str>) -> SequencedMessage {
        SequencedMessage {
            client_id: client_id.map(str::to_string),
            sequence_number: 10,
            minimum_sequence_number: 4,
            client_sequence_number: 1,
            reference_sequence_number: 9,
            message_type: MessageType::Operation,
            contents: json!({ "address": "c1", "contents": { "op": "inc" } }),
            origin: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_envelope_decoding() {
        let message = sequenced(Some("alice"));
        let envelope = message.envelope().unwrap();
        assert_eq!(envelope.address, "c1");
        assert_eq!(envelope.contents, json!({ "op": "inc" }));
    }

    #[test]
    fn test_is_from() {
        let message = sequenced(Some("alice"));
        assert!(message.is_from(Some("alice")));
        assert!(!message.is_from(Some("bob")));
        assert!(!message.is_from(None));

        let mut forwarded = message.clone();
        forwarded.origin = Some(MessageOrigin {
            id: "other-container".into(),
            sequence_number: 3,
            minimum_sequence_number: 1,
        });
        assert!(!forwarded.is_from(Some("alice")));
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(sequenced(None)).unwrap();
        assert_eq!(value["type"], json!("operation"));
        assert_eq!(value["sequenceNumber"], json!(10));
        assert!(value.get("origin").is_none());
    }
}
