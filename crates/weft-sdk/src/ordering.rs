//! In-memory ordering service and quorum.
//!
//! [`MemoryOrderer`] stamps every submitted message with the next document
//! sequence number and fans it out to all connected clients, the sender
//! included. Quorum membership changes and proposal outcomes travel on the
//! same per-client stream, so every client observes one total order of
//! [`Delivery`] items.
//!
//! The orderer also keeps the full message history and the latest saved
//! snapshot, which is enough for a client to load a document from scratch.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use ulid::Generator;
use weft_core::message::{
    DocumentMessage, MessageSink, SequenceNumber, SequencedMessage, SubmitError,
};
use weft_core::tree::{SnapshotTree, StoredTree};
use weft_runtime::{LoadPoint, MemberDetails, MemoryBlobStore, Quorum, QuorumError, QuorumEvent};

use crate::error::{Result, SdkError};

/// One item of a client's ordered stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Position in the orderer's global fan-out order.
    pub position: u64,
    pub payload: DeliveryPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryPayload {
    Sequenced(SequencedMessage),
    Quorum(QuorumEvent),
}

/// A snapshot persisted through the orderer.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedSnapshot {
    pub tree: StoredTree,
    pub point: LoadPoint,
}

struct ConnectedClient {
    tx: mpsc::UnboundedSender<Delivery>,
    reference_sequence_number: SequenceNumber,
}

struct OrdererState {
    sequence_number: SequenceNumber,
    minimum_sequence_number: SequenceNumber,
    position: u64,
    clients: BTreeMap<String, ConnectedClient>,
    members: BTreeMap<String, MemberDetails>,
    values: HashMap<String, String>,
    history: Vec<SequencedMessage>,
    ids: Generator,
}

impl OrdererState {
    fn fan_out(&mut self, payload: DeliveryPayload) {
        self.position += 1;
        let delivery = Delivery {
            position: self.position,
            payload,
        };
        for (client_id, client) in &self.clients {
            if client.tx.send(delivery.clone()).is_err() {
                trace!(client = %client_id, "Dropping delivery for closed stream");
            }
        }
    }

    fn recompute_minimum(&mut self) {
        let lowest = self
            .clients
            .values()
            .map(|client| client.reference_sequence_number)
            .min()
            .unwrap_or(self.sequence_number);
        self.minimum_sequence_number = self.minimum_sequence_number.max(lowest);
    }
}

/// In-process ordering service for one document.
pub struct MemoryOrderer {
    state: Mutex<OrdererState>,
    storage: Arc<MemoryBlobStore>,
    saved: RwLock<Option<SavedSnapshot>>,
}

impl MemoryOrderer {
    pub fn new() -> Arc<Self> {
        Self::with_storage(Arc::new(MemoryBlobStore::new()))
    }

    pub fn with_storage(storage: Arc<MemoryBlobStore>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OrdererState {
                sequence_number: 0,
                minimum_sequence_number: 0,
                position: 0,
                clients: BTreeMap::new(),
                members: BTreeMap::new(),
                values: HashMap::new(),
                history: Vec::new(),
                ids: Generator::new(),
            }),
            storage,
            saved: RwLock::new(None),
        })
    }

    /// Blob store backing saved snapshots.
    pub fn storage(&self) -> Arc<MemoryBlobStore> {
        Arc::clone(&self.storage)
    }

    /// Join the quorum.
    ///
    /// Client ids increase with join order. The returned stream starts with
    /// this client's own `MemberJoined` event; `position` is the stream
    /// position just before it.
    pub fn connect(
        &self,
        details: MemberDetails,
    ) -> Result<(String, u64, mpsc::UnboundedReceiver<Delivery>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let client_id = state
            .ids
            .generate()
            .map_err(|e| SdkError::ConnectionFailed(e.to_string()))?
            .to_string();
        let reference_sequence_number = state.sequence_number;
        let position = state.position;

        state.clients.insert(
            client_id.clone(),
            ConnectedClient {
                tx,
                reference_sequence_number,
            },
        );
        state.members.insert(client_id.clone(), details.clone());
        state.fan_out(DeliveryPayload::Quorum(QuorumEvent::MemberJoined {
            client_id: client_id.clone(),
            details,
        }));

        info!(client = %client_id, members = state.members.len(), "Client joined");
        Ok((client_id, position, rx))
    }

    /// Leave the quorum. The client's stream ends.
    pub fn disconnect(&self, client_id: &str) {
        let mut state = self.state.lock();
        if state.clients.remove(client_id).is_none() {
            return;
        }
        state.members.remove(client_id);
        state.recompute_minimum();
        state.fan_out(DeliveryPayload::Quorum(QuorumEvent::MemberLeft {
            client_id: client_id.to_string(),
        }));
        info!(client = %client_id, members = state.members.len(), "Client left");
    }

    /// Sequence and broadcast a message from `client_id`.
    pub fn submit(&self, client_id: &str, message: DocumentMessage) -> std::result::Result<SequenceNumber, SubmitError> {
        let mut state = self.state.lock();
        let Some(client) = state.clients.get_mut(client_id) else {
            return Err(SubmitError::Disconnected);
        };
        client.reference_sequence_number = client
            .reference_sequence_number
            .max(message.reference_sequence_number);

        state.sequence_number += 1;
        state.recompute_minimum();
        let sequenced = SequencedMessage {
            client_id: Some(client_id.to_string()),
            sequence_number: state.sequence_number,
            minimum_sequence_number: state.minimum_sequence_number,
            client_sequence_number: message.client_sequence_number,
            reference_sequence_number: message.reference_sequence_number,
            message_type: message.message_type,
            contents: message.contents,
            origin: None,
            timestamp: now_millis(),
        };
        debug!(
            client = %client_id,
            sequence_number = sequenced.sequence_number,
            message_type = ?sequenced.message_type,
            "Sequenced message"
        );
        state.history.push(sequenced.clone());
        state.fan_out(DeliveryPayload::Sequenced(sequenced));
        Ok(state.sequence_number)
    }

    /// Decide a proposal immediately.
    ///
    /// A key is vacant when unset or when its value names a client that has
    /// left. The first proposal for a vacant key wins.
    pub fn propose(&self, client_id: &str, key: &str, value: &str) -> std::result::Result<(), QuorumError> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(client_id) {
            return Err(QuorumError::Disconnected);
        }

        let holder = state.values.get(key).cloned();
        let vacant = match &holder {
            None => true,
            Some(current) => !state.members.contains_key(current),
        };

        if vacant {
            state.values.insert(key.to_string(), value.to_string());
            state.fan_out(DeliveryPayload::Quorum(QuorumEvent::ProposalAccepted {
                key: key.to_string(),
                value: value.to_string(),
            }));
            debug!(key = %key, value = %value, "Proposal accepted");
            Ok(())
        } else {
            state.fan_out(DeliveryPayload::Quorum(QuorumEvent::ProposalRejected {
                key: key.to_string(),
                value: value.to_string(),
            }));
            debug!(key = %key, value = %value, "Proposal rejected");
            Err(QuorumError::Rejected {
                key: key.to_string(),
                reason: format!("held by {}", holder.unwrap_or_default()),
            })
        }
    }

    pub fn members(&self) -> BTreeMap<String, MemberDetails> {
        self.state.lock().members.clone()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().values.get(key).cloned()
    }

    /// Last assigned sequence number.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.state.lock().sequence_number
    }

    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.state.lock().minimum_sequence_number
    }

    /// Position of the latest delivery.
    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.lock().clients.contains_key(client_id)
    }

    /// Messages sequenced after `sequence_number`, in order.
    pub fn messages_after(&self, sequence_number: SequenceNumber) -> Vec<SequencedMessage> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|message| message.sequence_number > sequence_number)
            .cloned()
            .collect()
    }

    /// Upload a container snapshot and make it the document's latest.
    pub fn save(&self, tree: &SnapshotTree, point: LoadPoint) -> Result<StoredTree> {
        let stored = self.storage.upload(tree)?;
        info!(
            sequence_number = point.sequence_number,
            tree = ?stored.id,
            "Snapshot saved"
        );
        *self.saved.write() = Some(SavedSnapshot {
            tree: stored.clone(),
            point,
        });
        Ok(stored)
    }

    pub fn latest_snapshot(&self) -> Option<SavedSnapshot> {
        self.saved.read().clone()
    }
}

impl std::fmt::Debug for MemoryOrderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryOrderer")
            .field("sequence_number", &state.sequence_number)
            .field("minimum_sequence_number", &state.minimum_sequence_number)
            .field("clients", &state.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// A client's connection to a [`MemoryOrderer`].
///
/// Survives reconnects: the runtime holds one link for its whole life while
/// the client id behind it changes.
pub struct OrdererLink {
    orderer: Arc<MemoryOrderer>,
    client_id: RwLock<Option<String>>,
}

impl OrdererLink {
    pub fn new(orderer: Arc<MemoryOrderer>) -> Self {
        Self {
            orderer,
            client_id: RwLock::new(None),
        }
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn set_client_id(&self, client_id: Option<String>) {
        *self.client_id.write() = client_id;
    }
}

impl MessageSink for OrdererLink {
    fn submit(&self, message: DocumentMessage) -> std::result::Result<(), SubmitError> {
        let client_id = self.client_id().ok_or(SubmitError::Disconnected)?;
        self.orderer.submit(&client_id, message).map(|_| ())
    }
}

#[async_trait]
impl Quorum for OrdererLink {
    fn members(&self) -> BTreeMap<String, MemberDetails> {
        self.orderer.members()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.orderer.value(key)
    }

    async fn propose(&self, key: &str, value: &str) -> std::result::Result<(), QuorumError> {
        let client_id = self.client_id().ok_or(QuorumError::Disconnected)?;
        self.orderer.propose(&client_id, key, value)
    }
}
