//! Channel registry.
//!
//! Owns every channel hosted by the container together with its lifecycle
//! state and delta connection. A channel id is bound to exactly one channel
//! for the container's lifetime; the first construction to claim an id wins.
//!
//! ```text
//! create ──► LocalUnattached ──attach──► LocalPendingAttach ──echo──► Attached
//! remote attach ─────────────────────────────────────────────────► RemoteAttached
//! stored snapshot ──► RemoteLoading ──(replay buffered)──────────► RemoteAttached
//! ```

use crate::channel::{ChannelHandle, ChannelServices, ChannelState};
use crate::error::{Result, RuntimeError};
use crate::factory::{resolve_package, FactoryRegistry};
use crate::outbox::Outbox;
use crate::snapshot::{SnapshotAssembler, SnapshotCandidate};
use crate::storage::{ChannelStorage, DocumentStorage, ObjectStorage, SnapshotStorage};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use weft_core::attributes::{ChannelAttributes, PackagePath, ATTRIBUTES_BLOB};
use weft_core::message::{
    AttachMessage, ConnectionState, MessageType, SequenceNumber, SequencedMessage, SubmitError,
};
use weft_core::tree::StoredTree;
use weft_delta::{BaseMapping, DeltaConnection};

/// Point of the document stream a stored snapshot was taken at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadPoint {
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
}

impl LoadPoint {
    pub fn new(sequence_number: SequenceNumber, minimum_sequence_number: SequenceNumber) -> Self {
        Self {
            sequence_number,
            minimum_sequence_number,
        }
    }
}

/// Result of processing an attach message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Echo of our own attach; the local channel is now attached.
    Acknowledged(String),
    /// A channel announced by another client was constructed.
    Remote(String),
    /// The id was already known; nothing changed.
    Duplicate(String),
}

#[derive(Clone)]
struct ChannelRecord {
    channel: ChannelHandle,
    package: PackagePath,
    state: ChannelState,
    connection: Option<Arc<DeltaConnection>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    stored_tree_id: Option<String>,
}

impl ChannelRecord {
    fn services(&self) -> Option<ChannelServices> {
        Some(ChannelServices {
            connection: Arc::clone(self.connection.as_ref()?),
            storage: Arc::clone(self.storage.as_ref()?),
        })
    }
}

enum Entry {
    /// Constructing from a snapshot; messages are held until it is live.
    Loading(Vec<SequencedMessage>),
    Live(ChannelRecord),
}

enum LoadSource {
    Attach {
        sequence_number: SequenceNumber,
        minimum_sequence_number: SequenceNumber,
    },
    Stored {
        point: LoadPoint,
        tree_id: Option<String>,
    },
}

/// Split an `Operation` message into its target channel and the message the
/// channel should see.
pub fn channel_message(message: &SequencedMessage) -> Result<(String, SequencedMessage)> {
    let envelope = message.envelope()?;
    let mut inner = message.clone();
    inner.contents = envelope.contents;
    Ok((envelope.address, inner))
}

/// What waiters on a channel id observe: the channel, or why it failed to load.
type Slot = Option<std::result::Result<ChannelHandle, String>>;

fn violation(reason: impl Into<String>) -> RuntimeError {
    RuntimeError::ProtocolInvariantViolation(reason.into())
}

/// All channels of one container.
pub struct ChannelRegistry {
    root: Arc<dyn FactoryRegistry>,
    outbox: Arc<Outbox>,
    connection_state: RwLock<ConnectionState>,
    client_id: RwLock<Option<String>>,
    entries: RwLock<HashMap<String, Entry>>,
    pending_attach: RwLock<Vec<AttachMessage>>,
    failed: RwLock<HashMap<String, String>>,
    slots: Mutex<HashMap<String, watch::Sender<Slot>>>,
}

impl ChannelRegistry {
    pub fn new(root: Arc<dyn FactoryRegistry>, outbox: Arc<Outbox>) -> Self {
        Self {
            root,
            outbox,
            connection_state: RwLock::new(ConnectionState::Disconnected),
            client_id: RwLock::new(None),
            entries: RwLock::new(HashMap::new()),
            pending_attach: RwLock::new(Vec::new()),
            failed: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Create a local, unattached channel of the type named by `package`.
    ///
    /// If the id is already taken by a channel of the same type, that channel
    /// is returned instead.
    pub async fn create_channel(&self, id: &str, package: PackagePath) -> Result<ChannelHandle> {
        if self.entries.read().contains_key(id) {
            return self.adopt(id, &package).await;
        }

        let factory = resolve_package(Arc::clone(&self.root), &package).await?;
        let channel = factory.create(id);

        let inserted = {
            let mut entries = self.entries.write();
            if entries.contains_key(id) {
                false
            } else {
                entries.insert(
                    id.to_string(),
                    Entry::Live(ChannelRecord {
                        channel: Arc::clone(&channel),
                        package: package.clone(),
                        state: ChannelState::LocalUnattached,
                        connection: None,
                        storage: None,
                        stored_tree_id: None,
                    }),
                );
                true
            }
        };
        if !inserted {
            return self.adopt(id, &package).await;
        }

        debug!(channel = %id, package = %package, "Channel created");
        self.publish(id, &channel);
        Ok(channel)
    }

    async fn adopt(&self, id: &str, package: &PackagePath) -> Result<ChannelHandle> {
        if let Some(reason) = self.failed.read().get(id) {
            return Err(RuntimeError::ChannelLoadFailed {
                id: id.to_string(),
                reason: reason.clone(),
            });
        }
        let existing = self.wait_for(id).await?;
        if existing.channel_type() != package.channel_type() {
            return Err(RuntimeError::ChannelTypeMismatch {
                id: id.to_string(),
                existing: existing.channel_type().to_string(),
                requested: package.channel_type().to_string(),
            });
        }
        debug!(channel = %id, "Adopted existing channel");
        Ok(existing)
    }

    /// Share a local channel with the quorum.
    ///
    /// The channel is connected immediately and may start submitting; it is
    /// only reported as attached once its attach message is echoed back.
    /// Returns the services handed to the channel.
    pub fn attach_channel(&self, id: &str) -> Result<ChannelServices> {
        let record = self
            .record(id)
            .ok_or_else(|| RuntimeError::ChannelNotFound(id.to_string()))?;
        if record.state != ChannelState::LocalUnattached {
            debug!(channel = %id, state = %record.state, "Channel already shared");
            return self.shared_services(id);
        }

        let snapshot = SnapshotAssembler::detached_tree(&record.channel, &record.package)?;
        let attach = AttachMessage {
            id: id.to_string(),
            channel_type: record.package.channel_type().to_string(),
            snapshot: snapshot.clone(),
        };
        let connection = Arc::new(DeltaConnection::new(
            id,
            *self.connection_state.read(),
            self.outbox.channel_submitter(id),
        ));
        let services = ChannelServices {
            connection: Arc::clone(&connection),
            storage: Arc::new(SnapshotStorage::new(snapshot)),
        };

        let claimed = {
            let mut entries = self.entries.write();
            match entries.get_mut(id) {
                Some(Entry::Live(live)) if live.state == ChannelState::LocalUnattached => {
                    live.state = ChannelState::LocalPendingAttach;
                    live.connection = Some(connection);
                    live.storage = Some(Arc::clone(&services.storage));
                    true
                }
                _ => false,
            }
        };
        if !claimed {
            return self.shared_services(id);
        }
        self.pending_attach.write().push(attach.clone());

        record.channel.connect(services.clone());
        info!(channel = %id, channel_type = %attach.channel_type, "Attaching channel");
        self.submit_attach(&attach)?;
        Ok(services)
    }

    fn shared_services(&self, id: &str) -> Result<ChannelServices> {
        self.record(id)
            .and_then(|record| record.services())
            .ok_or_else(|| violation(format!("shared channel {id} has no services")))
    }

    fn submit_attach(&self, attach: &AttachMessage) -> Result<()> {
        let contents = serde_json::to_value(attach)?;
        match self.outbox.submit(MessageType::Attach, contents) {
            Ok(_) => Ok(()),
            Err(SubmitError::Disconnected) => {
                debug!(channel = %attach.id, "Attach deferred until reconnect");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a sequenced attach message.
    pub async fn process_attach(&self, message: &SequencedMessage) -> Result<AttachOutcome> {
        let attach = message.attach()?;
        let id = attach.id.clone();

        if self.take_pending(&attach)? {
            self.acknowledge(&id, message)?;
            return Ok(AttachOutcome::Acknowledged(id));
        }

        let reserved = {
            let mut entries = self.entries.write();
            match entries.get(&id) {
                Some(Entry::Live(record)) if record.state == ChannelState::LocalUnattached => {
                    return Err(violation(format!(
                        "remote attach for local unattached channel {id}"
                    )));
                }
                Some(_) => false,
                None => {
                    entries.insert(id.clone(), Entry::Loading(Vec::new()));
                    true
                }
            }
        };
        if !reserved {
            debug!(channel = %id, sequence_number = message.sequence_number, "Duplicate attach ignored");
            return Ok(AttachOutcome::Duplicate(id));
        }

        let storage: Arc<dyn ObjectStorage> = Arc::new(SnapshotStorage::new(attach.snapshot));
        let source = LoadSource::Attach {
            sequence_number: message.sequence_number,
            minimum_sequence_number: message.minimum_sequence_number,
        };
        self.load_channel(&id, storage, source, Vec::new()).await?;
        info!(channel = %id, channel_type = %attach.channel_type, "Remote channel attached");
        Ok(AttachOutcome::Remote(id))
    }

    /// Remove `attach` from the pending set if it is ours.
    fn take_pending(&self, attach: &AttachMessage) -> Result<bool> {
        let mut pending = self.pending_attach.write();
        let Some(index) = pending.iter().position(|p| p.id == attach.id) else {
            return Ok(false);
        };
        if pending[index] != *attach {
            return Err(violation(format!(
                "attach for {} does not match the pending local attach",
                attach.id
            )));
        }
        pending.remove(index);
        Ok(true)
    }

    fn acknowledge(&self, id: &str, message: &SequencedMessage) -> Result<()> {
        let connection = {
            let mut entries = self.entries.write();
            match entries.get_mut(id) {
                Some(Entry::Live(record)) if record.state == ChannelState::LocalPendingAttach => {
                    record.state = ChannelState::Attached;
                    record.connection.clone()
                }
                _ => None,
            }
        }
        .ok_or_else(|| violation(format!("attach echo for {id} without a pending channel")))?;

        connection.set_base_mapping(
            BaseMapping::attach(message.sequence_number),
            message.minimum_sequence_number,
        )?;
        info!(channel = %id, sequence_number = message.sequence_number, "Channel attached");
        Ok(())
    }

    /// Mark `id` as loading so operations for it are buffered.
    ///
    /// Returns false if the id is already loading.
    pub fn begin_load(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(Entry::Loading(_)) => Ok(false),
            Some(Entry::Live(_)) => Err(violation(format!("channel {id} is already loaded"))),
            None => {
                entries.insert(id.to_string(), Entry::Loading(Vec::new()));
                Ok(true)
            }
        }
    }

    /// Construct a channel from its subtree of a stored snapshot.
    ///
    /// `backlog` holds operations sequenced after the snapshot; those at or
    /// before the channel's anchor are skipped. A failure affects this
    /// channel only and is remembered.
    pub async fn load_from_snapshot(
        &self,
        id: &str,
        tree: StoredTree,
        storage: Arc<dyn DocumentStorage>,
        point: LoadPoint,
        backlog: Vec<SequencedMessage>,
    ) -> Result<ChannelHandle> {
        self.begin_load(id)?;
        let source = LoadSource::Stored {
            point,
            tree_id: tree.id.clone(),
        };
        let view: Arc<dyn ObjectStorage> = Arc::new(ChannelStorage::new(storage, tree));
        self.load_channel(id, view, source, backlog).await
    }

    async fn load_channel(
        &self,
        id: &str,
        storage: Arc<dyn ObjectStorage>,
        source: LoadSource,
        backlog: Vec<SequencedMessage>,
    ) -> Result<ChannelHandle> {
        let result = self.try_load(id, storage, source, backlog).await;
        result.map_err(|err| self.fail_load(id, err))
    }

    async fn try_load(
        &self,
        id: &str,
        storage: Arc<dyn ObjectStorage>,
        source: LoadSource,
        backlog: Vec<SequencedMessage>,
    ) -> Result<ChannelHandle> {
        let bytes = storage.read(ATTRIBUTES_BLOB).await?;
        let attributes = ChannelAttributes::parse(&bytes)?;
        let package = attributes.package()?;
        let factory = resolve_package(Arc::clone(&self.root), &package).await?;
        let channel = factory.load(id, storage.as_ref(), &attributes).await?;

        let (mapping, minimum, stored_tree_id) = match source {
            LoadSource::Attach {
                sequence_number,
                minimum_sequence_number,
            } => (BaseMapping::attach(sequence_number), minimum_sequence_number, None),
            LoadSource::Stored { point, tree_id } => {
                let local = attributes.sequence_number.unwrap_or(0);
                let document = attributes
                    .document_sequence_number
                    .unwrap_or(point.sequence_number);
                (
                    BaseMapping::new(local, document),
                    point.minimum_sequence_number,
                    tree_id,
                )
            }
        };

        let connection = Arc::new(DeltaConnection::new(
            id,
            *self.connection_state.read(),
            self.outbox.channel_submitter(id),
        ));
        connection.set_base_mapping(mapping, minimum)?;
        channel.connect(ChannelServices {
            connection: Arc::clone(&connection),
            storage: Arc::clone(&storage),
        });

        let record = ChannelRecord {
            channel: Arc::clone(&channel),
            package,
            state: ChannelState::RemoteAttached,
            connection: Some(connection),
            storage: Some(storage),
            stored_tree_id,
        };
        self.go_live(id, record, backlog)?;
        Ok(channel)
    }

    /// Replay `backlog` and anything buffered meanwhile, then expose the channel.
    fn go_live(&self, id: &str, record: ChannelRecord, backlog: Vec<SequencedMessage>) -> Result<()> {
        let connection = record
            .connection
            .clone()
            .ok_or_else(|| violation(format!("channel {id} has no connection")))?;
        let base = connection.base_document_sequence_number().unwrap_or(0);

        let mut pending = backlog;
        loop {
            let replayed = pending.len();
            for message in pending.drain(..) {
                if message.sequence_number <= base {
                    continue;
                }
                let local = message.is_from(self.client_id.read().as_deref());
                connection.process(record.channel.as_ref(), &message, local)?;
            }
            if replayed > 0 {
                trace!(channel = %id, replayed, "Replayed buffered messages");
            }

            let mut entries = self.entries.write();
            let buffered = match entries.get_mut(id) {
                Some(Entry::Loading(buffer)) => std::mem::take(buffer),
                _ => return Err(violation(format!("channel {id} left the loading state"))),
            };
            if buffered.is_empty() {
                entries.insert(id.to_string(), Entry::Live(record.clone()));
                break;
            }
            pending = buffered;
        }

        self.publish(id, &record.channel);
        Ok(())
    }

    fn fail_load(&self, id: &str, err: RuntimeError) -> RuntimeError {
        self.entries.write().remove(id);
        let reason = err.to_string();
        self.publish_failure(id, &reason);
        if err.is_fatal() {
            return err;
        }
        warn!(channel = %id, %reason, "Channel failed to load");
        self.failed.write().insert(id.to_string(), reason.clone());
        RuntimeError::ChannelLoadFailed {
            id: id.to_string(),
            reason,
        }
    }

    /// Route a sequenced `Operation` message to its channel.
    pub fn process_operation(&self, message: &SequencedMessage) -> Result<()> {
        let (address, message) = channel_message(message)?;

        let record = {
            let mut entries = self.entries.write();
            match entries.get_mut(&address) {
                Some(Entry::Loading(buffer)) => {
                    trace!(channel = %address, sequence_number = message.sequence_number, "Buffering message for loading channel");
                    buffer.push(message);
                    return Ok(());
                }
                Some(Entry::Live(record)) => Some(record.clone()),
                None => None,
            }
        };

        let Some(record) = record else {
            if let Some(reason) = self.failed.read().get(&address) {
                return Err(RuntimeError::ChannelLoadFailed {
                    id: address,
                    reason: reason.clone(),
                });
            }
            return Err(violation(format!("operation for unknown channel {address}")));
        };
        if !record.state.is_attached() {
            return Err(violation(format!(
                "operation for channel {address} in state {}",
                record.state
            )));
        }
        let connection = record
            .connection
            .ok_or_else(|| violation(format!("channel {address} has no connection")))?;

        let local = message.is_from(self.client_id.read().as_deref());
        connection.process(record.channel.as_ref(), &message, local)?;
        Ok(())
    }

    /// Future resolving to the channel once `id` is known, or to
    /// [`RuntimeError::ChannelLoadFailed`] if constructing it failed.
    ///
    /// Stays pending while the id is unknown; drop it to stop waiting.
    pub fn wait_for(&self, id: &str) -> impl Future<Output = Result<ChannelHandle>> + Send + 'static {
        let mut receiver = self.slot(id);
        let id = id.to_string();
        async move {
            let slot = receiver
                .wait_for(Option::is_some)
                .await
                .map(|slot| (*slot).clone())
                .map_err(|_| RuntimeError::ClosedContainer)?;
            match slot {
                Some(Ok(channel)) => Ok(channel),
                Some(Err(reason)) => Err(RuntimeError::ChannelLoadFailed { id, reason }),
                None => Err(RuntimeError::ClosedContainer),
            }
        }
    }

    fn slot(&self, id: &str) -> watch::Receiver<Slot> {
        self.slots
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn publish(&self, id: &str, channel: &ChannelHandle) {
        let mut slots = self.slots.lock();
        let sender = slots
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(None).0);
        // A failed id may be constructed again; a live channel is never replaced.
        sender.send_if_modified(|slot| {
            if matches!(slot, Some(Ok(_))) {
                return false;
            }
            *slot = Some(Ok(Arc::clone(channel)));
            true
        });
    }

    fn publish_failure(&self, id: &str, reason: &str) {
        let mut slots = self.slots.lock();
        let sender = slots
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_if_modified(|slot| {
            if matches!(slot, Some(Ok(_))) {
                return false;
            }
            *slot = Some(Err(reason.to_string()));
            true
        });
    }

    /// Propagate connectivity to every connected channel.
    ///
    /// On reconnect, pending attach messages are resubmitted unchanged.
    /// Returns how many were resubmitted.
    pub fn set_connection_state(&self, state: ConnectionState, client_id: Option<&str>) -> Result<usize> {
        *self.connection_state.write() = state;
        if state == ConnectionState::Connected {
            *self.client_id.write() = client_id.map(str::to_string);
        }

        for record in self.records() {
            if let Some(connection) = &record.connection {
                connection.set_connection_state(record.channel.as_ref(), state);
            }
        }

        if state != ConnectionState::Connected {
            return Ok(0);
        }
        let pending = self.pending_attaches();
        for attach in &pending {
            self.submit_attach(attach)?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Resubmitted pending attach messages");
        }
        Ok(pending.len())
    }

    /// Advance the minimum sequence number on every mapped channel.
    pub fn update_minimum_sequence_number(&self, minimum_sequence_number: SequenceNumber) {
        for record in self.records() {
            if let Some(connection) = &record.connection {
                connection.update_minimum_sequence_number(record.channel.as_ref(), minimum_sequence_number);
            }
        }
    }

    /// Whether any local change is still awaiting acknowledgement.
    pub fn has_unacked_ops(&self) -> bool {
        if !self.pending_attach.read().is_empty() {
            return true;
        }
        self.records().iter().any(|record| {
            record
                .connection
                .as_ref()
                .map(|connection| connection.is_dirty())
                .unwrap_or(false)
        })
    }

    fn record(&self, id: &str) -> Option<ChannelRecord> {
        match self.entries.read().get(id) {
            Some(Entry::Live(record)) => Some(record.clone()),
            _ => None,
        }
    }

    fn records(&self) -> Vec<ChannelRecord> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| match entry {
                Entry::Live(record) => Some(record.clone()),
                Entry::Loading(_) => None,
            })
            .collect()
    }

    /// Live channels in id order, as input to snapshot assembly.
    pub fn snapshot_candidates(&self) -> Vec<SnapshotCandidate> {
        let mut candidates: Vec<SnapshotCandidate> = self
            .entries
            .read()
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Live(record) => Some(SnapshotCandidate {
                    id: id.clone(),
                    state: record.state,
                    package: record.package.clone(),
                    channel: Arc::clone(&record.channel),
                    connection: record.connection.clone(),
                    stored_tree_id: record.stored_tree_id.clone(),
                }),
                Entry::Loading(_) => None,
            })
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    pub fn channel(&self, id: &str) -> Option<ChannelHandle> {
        self.record(id).map(|record| record.channel)
    }

    pub fn connection(&self, id: &str) -> Option<Arc<DeltaConnection>> {
        self.record(id).and_then(|record| record.connection)
    }

    pub fn state(&self, id: &str) -> Option<ChannelState> {
        match self.entries.read().get(id)? {
            Entry::Loading(_) => Some(ChannelState::RemoteLoading),
            Entry::Live(record) => Some(record.state),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pending_attaches(&self) -> Vec<AttachMessage> {
        self.pending_attach.read().clone()
    }

    /// Channels that failed to load, with the reason.
    pub fn failed_loads(&self) -> HashMap<String, String> {
        self.failed.read().clone()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.ids())
            .field("pending_attach", &self.pending_attach.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelFactory, SharedChannel};
    use crate::factory::MemoryRegistry;
    use crate::storage::{MemoryBlobStore, StorageError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::any::Any;
    use weft_core::message::{DocumentMessage, MessageSink};
    use weft_core::tree::SnapshotTree;
    use weft_delta::{DeltaError, DeltaHandler};

    #[derive(Default)]
    struct Captured(Mutex<Vec<DocumentMessage>>);

    impl MessageSink for Captured {
        fn submit(&self, message: DocumentMessage) -> std::result::Result<(), SubmitError> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    struct Recorder {
        id: String,
        seen: Mutex<Vec<SequenceNumber>>,
    }

    impl DeltaHandler for Recorder {
        fn process(&self, message: &SequencedMessage, _: bool) -> std::result::Result<(), DeltaError> {
            self.seen.lock().push(message.sequence_number);
            Ok(())
        }
        fn min_sequence_number_changed(&self, _: SequenceNumber) {}
        fn set_connection_state(&self, _: ConnectionState) {}
    }

    impl SharedChannel for Recorder {
        fn id(&self) -> &str {
            &self.id
        }
        fn channel_type(&self) -> &str {
            "recorder"
        }
        fn snapshot(&self) -> SnapshotTree {
            let mut tree = SnapshotTree::new();
            tree.add_blob("seen", self.seen.lock().len().to_string().into_bytes());
            tree
        }
        fn connect(&self, _: ChannelServices) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct RecorderFactory;

    #[async_trait]
    impl ChannelFactory for RecorderFactory {
        fn channel_type(&self) -> &str {
            "recorder"
        }
        fn create(&self, id: &str) -> ChannelHandle {
            Arc::new(Recorder {
                id: id.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
        async fn load(
            &self,
            id: &str,
            storage: &dyn ObjectStorage,
            _: &ChannelAttributes,
        ) -> Result<ChannelHandle> {
            storage.read("seen").await?;
            Ok(self.create(id))
        }
    }

    /// Loads yield once and then fail.
    struct FlakyFactory;

    #[async_trait]
    impl ChannelFactory for FlakyFactory {
        fn channel_type(&self) -> &str {
            "flaky"
        }
        fn create(&self, id: &str) -> ChannelHandle {
            RecorderFactory.create(id)
        }
        async fn load(
            &self,
            id: &str,
            _: &dyn ObjectStorage,
            _: &ChannelAttributes,
        ) -> Result<ChannelHandle> {
            tokio::task::yield_now().await;
            Err(StorageError::BlobNotFound(format!("{id}/state")).into())
        }
    }

    fn registry() -> (ChannelRegistry, Arc<Captured>) {
        let sink = Arc::new(Captured::default());
        let root = Arc::new(
            MemoryRegistry::new()
                .with_factory(Arc::new(RecorderFactory))
                .with_factory(Arc::new(FlakyFactory)),
        );
        let registry = ChannelRegistry::new(root, Arc::new(Outbox::new(sink.clone())));
        registry
            .set_connection_state(ConnectionState::Connected, Some("alice"))
            .unwrap();
        (registry, sink)
    }

    fn sequenced(sent: &DocumentMessage, seq: SequenceNumber, client: &str) -> SequencedMessage {
        SequencedMessage {
            client_id: Some(client.to_string()),
            sequence_number: seq,
            minimum_sequence_number: 0,
            client_sequence_number: sent.client_sequence_number,
            reference_sequence_number: sent.reference_sequence_number,
            message_type: sent.message_type,
            contents: sent.contents.clone(),
            origin: None,
            timestamp: 0,
        }
    }

    fn operation(address: &str, seq: SequenceNumber) -> SequencedMessage {
        SequencedMessage {
            client_id: Some("bob".into()),
            sequence_number: seq,
            minimum_sequence_number: 0,
            client_sequence_number: 1,
            reference_sequence_number: seq - 1,
            message_type: MessageType::Operation,
            contents: json!({ "address": address, "contents": {} }),
            origin: None,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_attach_acknowledged_by_echo() {
        let (registry, sink) = registry();
        registry.create_channel("c1", "recorder".into()).await.unwrap();
        assert_eq!(registry.state("c1"), Some(ChannelState::LocalUnattached));

        let services = registry.attach_channel("c1").unwrap();
        assert!(Arc::ptr_eq(&services.connection, &registry.connection("c1").unwrap()));
        assert_eq!(registry.state("c1"), Some(ChannelState::LocalPendingAttach));
        assert!(registry.has_unacked_ops());

        let echo = sequenced(&sink.0.lock()[0], 5, "alice");
        let outcome = registry.process_attach(&echo).await.unwrap();
        assert_eq!(outcome, AttachOutcome::Acknowledged("c1".into()));
        assert_eq!(registry.state("c1"), Some(ChannelState::Attached));
        assert_eq!(
            registry.connection("c1").unwrap().base_document_sequence_number(),
            Some(5)
        );
        assert!(!registry.has_unacked_ops());
    }

    #[tokio::test]
    async fn test_create_adopts_same_type() {
        let (registry, _) = registry();
        let first = registry.create_channel("c1", "recorder".into()).await.unwrap();
        let second = registry.create_channel("c1", "recorder".into()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(format!("{first:?}").contains("c1"));
    }

    #[tokio::test]
    async fn test_create_racing_failed_remote_load() {
        let (registry, _) = registry();
        let mut snapshot = SnapshotTree::new();
        snapshot
            .add_json(ATTRIBUTES_BLOB, &ChannelAttributes::new(&"flaky".into()).unwrap())
            .unwrap();
        let attach = AttachMessage {
            id: "c1".into(),
            channel_type: "flaky".into(),
            snapshot,
        };
        let remote = SequencedMessage {
            client_id: Some("bob".into()),
            sequence_number: 4,
            minimum_sequence_number: 0,
            client_sequence_number: 1,
            reference_sequence_number: 3,
            message_type: MessageType::Attach,
            contents: serde_json::to_value(&attach).unwrap(),
            origin: None,
            timestamp: 0,
        };

        let (attached, created) = tokio::join!(
            registry.process_attach(&remote),
            tokio::time::timeout(
                std::time::Duration::from_secs(1),
                registry.create_channel("c1", "recorder".into()),
            ),
        );

        assert!(matches!(attached, Err(RuntimeError::ChannelLoadFailed { .. })));
        let created = created.expect("create_channel must observe the failed load");
        assert!(matches!(created, Err(RuntimeError::ChannelLoadFailed { ref id, .. }) if id == "c1"));
        assert_eq!(registry.state("c1"), None);
    }

    #[tokio::test]
    async fn test_wait_for_observes_failed_load() {
        let (registry, _) = registry();
        let mut waiter = tokio_test::task::spawn(registry.wait_for("c1"));
        tokio_test::assert_pending!(waiter.poll());

        let store = Arc::new(MemoryBlobStore::new());
        registry
            .load_from_snapshot("c1", StoredTree::new(), store, LoadPoint::default(), Vec::new())
            .await
            .unwrap_err();

        assert!(waiter.is_woken());
        assert!(matches!(
            waiter.poll(),
            std::task::Poll::Ready(Err(RuntimeError::ChannelLoadFailed { .. }))
        ));

        // The id can still be claimed afterwards.
        registry.create_channel("c1", "recorder".into()).await.unwrap();
        assert_eq!(registry.wait_for("c1").await.unwrap().id(), "c1");
    }

    #[tokio::test]
    async fn test_operation_for_unknown_channel() {
        let (registry, _) = registry();
        let err = registry.process_operation(&operation("ghost", 3)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_operation_for_unattached_channel() {
        let (registry, _) = registry();
        registry.create_channel("c1", "recorder".into()).await.unwrap();
        assert!(matches!(
            registry.process_operation(&operation("c1", 3)),
            Err(RuntimeError::ProtocolInvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_attach_over_local_unattached() {
        let (registry, sink) = registry();
        registry.create_channel("c1", "recorder".into()).await.unwrap();

        // Build an attach for the same id from a second registry.
        let (other, other_sink) = registry_pair_source().await;
        other.attach_channel("c1").unwrap();
        let remote = sequenced(&other_sink.0.lock()[0], 4, "bob");

        assert!(matches!(
            registry.process_attach(&remote).await,
            Err(RuntimeError::ProtocolInvariantViolation(_))
        ));
        assert!(sink.0.lock().is_empty());
    }

    async fn registry_pair_source() -> (ChannelRegistry, Arc<Captured>) {
        let (other, sink) = registry();
        other.create_channel("c1", "recorder".into()).await.unwrap();
        (other, sink)
    }

    #[tokio::test]
    async fn test_remote_attach_and_duplicate() {
        let (registry, _) = registry();
        let (other, other_sink) = registry_pair_source().await;
        other.attach_channel("c1").unwrap();
        let remote = sequenced(&other_sink.0.lock()[0], 4, "bob");

        assert_eq!(
            registry.process_attach(&remote).await.unwrap(),
            AttachOutcome::Remote("c1".into())
        );
        assert_eq!(registry.state("c1"), Some(ChannelState::RemoteAttached));
        assert_eq!(
            registry.process_attach(&remote).await.unwrap(),
            AttachOutcome::Duplicate("c1".into())
        );

        registry.process_operation(&operation("c1", 6)).unwrap();
        let channel = registry.channel("c1").unwrap();
        let recorder = crate::channel::downcast::<Recorder>(&channel).unwrap();
        assert_eq!(*recorder.seen.lock(), vec![2]);
    }

    #[tokio::test]
    async fn test_operations_buffered_while_loading() {
        let (registry, _) = registry();
        let store = Arc::new(MemoryBlobStore::new());

        let mut channel_tree = SnapshotTree::new();
        channel_tree.add_blob("seen", b"0".to_vec());
        let attributes = ChannelAttributes::new(&"recorder".into())
            .unwrap()
            .with_sequence_numbers(3, 0)
            .at_document_sequence_number(10);
        channel_tree.add_json(ATTRIBUTES_BLOB, &attributes).unwrap();
        let mut root = SnapshotTree::new();
        root.add_tree("c1", channel_tree);
        let stored = store.upload(&root).unwrap();

        assert!(registry.begin_load("c1").unwrap());
        assert_eq!(registry.state("c1"), Some(ChannelState::RemoteLoading));
        registry.process_operation(&operation("c1", 12)).unwrap();

        let backlog = vec![operation("c1", 9), operation("c1", 11)];
        let channel = registry
            .load_from_snapshot(
                "c1",
                stored.trees["c1"].clone(),
                store,
                LoadPoint::new(10, 0),
                backlog,
            )
            .await
            .unwrap();

        let recorder = crate::channel::downcast::<Recorder>(&channel).unwrap();
        assert_eq!(*recorder.seen.lock(), vec![4, 5]);
        assert_eq!(registry.state("c1"), Some(ChannelState::RemoteAttached));
    }

    #[tokio::test]
    async fn test_failed_load_is_remembered() {
        let (registry, _) = registry();
        let store = Arc::new(MemoryBlobStore::new());
        let err = registry
            .load_from_snapshot("c1", StoredTree::new(), store, LoadPoint::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ChannelLoadFailed { .. }));
        assert!(registry.failed_loads().contains_key("c1"));
        assert!(matches!(
            registry.process_operation(&operation("c1", 2)),
            Err(RuntimeError::ChannelLoadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_create() {
        let (registry, _) = registry();
        let mut waiter = tokio_test::task::spawn(registry.wait_for("c1"));
        tokio_test::assert_pending!(waiter.poll());

        registry.create_channel("c1", "recorder".into()).await.unwrap();
        assert!(waiter.is_woken());
        let channel = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(channel.id(), "c1");
    }

    #[tokio::test]
    async fn test_reconnect_resubmits_pending_attach() {
        let sink = Arc::new(Captured::default());
        let root = Arc::new(MemoryRegistry::new().with_factory(Arc::new(RecorderFactory)));
        let registry = ChannelRegistry::new(root, Arc::new(Outbox::new(sink.clone())));

        registry.create_channel("c1", "recorder".into()).await.unwrap();
        registry.attach_channel("c1").unwrap();
        assert_eq!(sink.0.lock().len(), 1);

        registry
            .set_connection_state(ConnectionState::Disconnected, None)
            .unwrap();
        let resent = registry
            .set_connection_state(ConnectionState::Connected, Some("alice-2"))
            .unwrap();
        assert_eq!(resent, 1);

        let sent = sink.0.lock();
        assert_eq!(sent[0].contents, sent[1].contents);
    }
}
