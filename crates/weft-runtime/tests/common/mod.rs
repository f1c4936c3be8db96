//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use weft_core::attributes::ChannelAttributes;
use weft_core::message::{
    ConnectionState, DocumentMessage, MessageSink, SequenceNumber, SequencedMessage, SubmitError,
};
use weft_core::tree::SnapshotTree;
use weft_delta::{DeltaError, DeltaHandler};
use weft_runtime::{
    ChannelFactory, ChannelHandle, ChannelServices, DocumentStorage, FactoryRegistry,
    MemberDetails, MemoryRegistry, ObjectStorage, Quorum, QuorumError, RuntimeContext,
    RuntimeError, SharedChannel,
};

// ============================================================================
// Note channel: a single last-writer-wins value
// ============================================================================

pub struct Note {
    id: String,
    channel_type: String,
    value: Mutex<i64>,
    applied: Mutex<Vec<SequenceNumber>>,
    services: Mutex<Option<ChannelServices>>,
}

impl Note {
    pub fn new(id: &str, channel_type: &str, value: i64) -> Self {
        Self {
            id: id.to_string(),
            channel_type: channel_type.to_string(),
            value: Mutex::new(value),
            applied: Mutex::new(Vec::new()),
            services: Mutex::new(None),
        }
    }

    pub fn value(&self) -> i64 {
        *self.value.lock()
    }

    /// Local sequence numbers of applied operations.
    pub fn applied(&self) -> Vec<SequenceNumber> {
        self.applied.lock().clone()
    }

    pub fn set(&self, value: i64) -> Result<SequenceNumber, DeltaError> {
        let connection = self
            .services
            .lock()
            .as_ref()
            .map(|services| Arc::clone(&services.connection))
            .ok_or_else(|| DeltaError::NotConnected(self.id.clone()))?;
        connection.submit(json!({ "set": value }))
    }
}

impl DeltaHandler for Note {
    fn process(&self, message: &SequencedMessage, _local: bool) -> Result<(), DeltaError> {
        let value = message.contents["set"]
            .as_i64()
            .ok_or_else(|| DeltaError::Handler {
                channel: self.id.clone(),
                sequence_number: message.sequence_number,
                reason: "missing value".into(),
            })?;
        *self.value.lock() = value;
        self.applied.lock().push(message.sequence_number);
        Ok(())
    }

    fn min_sequence_number_changed(&self, _: SequenceNumber) {}

    fn set_connection_state(&self, _: ConnectionState) {}
}

impl SharedChannel for Note {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    fn snapshot(&self) -> SnapshotTree {
        let mut tree = SnapshotTree::new();
        tree.add_blob("value", self.value().to_string().into_bytes());
        tree
    }

    fn connect(&self, services: ChannelServices) {
        *self.services.lock() = Some(services);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct NoteFactory(pub &'static str);

#[async_trait]
impl ChannelFactory for NoteFactory {
    fn channel_type(&self) -> &str {
        self.0
    }

    fn create(&self, id: &str) -> ChannelHandle {
        Arc::new(Note::new(id, self.0, 0))
    }

    async fn load(
        &self,
        id: &str,
        storage: &dyn ObjectStorage,
        _attributes: &ChannelAttributes,
    ) -> Result<ChannelHandle, RuntimeError> {
        let bytes = storage.read("value").await?;
        let value = String::from_utf8_lossy(&bytes)
            .parse::<i64>()
            .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        Ok(Arc::new(Note::new(id, self.0, value)))
    }
}

pub fn note(channel: &ChannelHandle) -> &Note {
    weft_runtime::downcast::<Note>(channel).expect("note channel")
}

/// `note` at the top level and `Comp/Sub`.
pub fn factories() -> Arc<dyn FactoryRegistry> {
    let comp = MemoryRegistry::new().with_factory(Arc::new(NoteFactory("Sub")));
    Arc::new(
        MemoryRegistry::new()
            .with_factory(Arc::new(NoteFactory("note")))
            .with_registry("Comp", Arc::new(comp)),
    )
}

// ============================================================================
// Wire: captures outbound messages; sequencing is done by hand
// ============================================================================

pub struct Wire {
    sent: Mutex<Vec<DocumentMessage>>,
    connected: AtomicBool,
}

impl Wire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<DocumentMessage> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<DocumentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl MessageSink for Wire {
    fn submit(&self, message: DocumentMessage) -> Result<(), SubmitError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SubmitError::Disconnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Stamp a sent message as the ordering service would.
pub fn sequence(
    client_id: &str,
    message: &DocumentMessage,
    sequence_number: SequenceNumber,
    minimum_sequence_number: SequenceNumber,
) -> SequencedMessage {
    SequencedMessage {
        client_id: Some(client_id.to_string()),
        sequence_number,
        minimum_sequence_number,
        client_sequence_number: message.client_sequence_number,
        reference_sequence_number: message.reference_sequence_number,
        message_type: message.message_type,
        contents: message.contents.clone(),
        origin: None,
        timestamp: 0,
    }
}

// ============================================================================
// Quorum double
// ============================================================================

#[derive(Default)]
pub struct FixedQuorum {
    members: RwLock<BTreeMap<String, MemberDetails>>,
    values: RwLock<HashMap<String, String>>,
    proposals: Mutex<Vec<(String, String)>>,
}

impl FixedQuorum {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(&self, client_id: &str, details: MemberDetails) {
        self.members.write().insert(client_id.to_string(), details);
    }

    pub fn leave(&self, client_id: &str) {
        self.members.write().remove(client_id);
    }

    pub fn accept(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }

    pub fn take_proposals(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.proposals.lock())
    }
}

#[async_trait]
impl Quorum for FixedQuorum {
    fn members(&self) -> BTreeMap<String, MemberDetails> {
        self.members.read().clone()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    async fn propose(&self, key: &str, value: &str) -> Result<(), QuorumError> {
        self.proposals.lock().push((key.to_string(), value.to_string()));
        Ok(())
    }
}

pub fn context(
    wire: Arc<Wire>,
    quorum: Arc<FixedQuorum>,
    storage: Arc<dyn DocumentStorage>,
) -> RuntimeContext {
    RuntimeContext {
        sink: wire,
        quorum,
        storage,
        registry: factories(),
    }
}
