//! The container runtime.
//!
//! Hosts the channels of one container, applies the ordered document stream
//! to them, snapshots them, and takes part in leader election.
//!
//! Sequenced messages must be handed to [`ContainerRuntime::process`] one at
//! a time in sequence order; everything else may be called concurrently.

use crate::channel::{ChannelHandle, ChannelServices, ChannelState};
use crate::config::RuntimeConfig;
use crate::election::{ElectionAction, ElectionEvent, ElectionStep, LeaderElection};
use crate::error::{Result, RuntimeError};
use crate::factory::FactoryRegistry;
use crate::outbox::Outbox;
use crate::quorum::{MemberDetails, Quorum, QuorumEvent};
use crate::registry::{channel_message, AttachOutcome, ChannelRegistry, LoadPoint};
use crate::snapshot::SnapshotAssembler;
use crate::storage::{DocumentStorage, PrefetchedStorage};
use crate::tasks::{analyze_tasks, TaskAssignment, TaskRegistration};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use weft_core::attributes::{AttributesError, PackagePath, ATTRIBUTES_BLOB};
use weft_core::message::{
    ConnectionState, MessageSink, MessageType, RemoteHelpMessage, SequenceNumber, SequencedMessage,
    SubmitError,
};
use weft_core::tree::{SnapshotTree, StoredTree};

/// External services a runtime depends on.
#[derive(Clone)]
pub struct RuntimeContext {
    pub sink: Arc<dyn MessageSink>,
    pub quorum: Arc<dyn Quorum>,
    pub storage: Arc<dyn DocumentStorage>,
    pub registry: Arc<dyn FactoryRegistry>,
}

/// Notifications published by the runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeEvent {
    ChannelCreated {
        id: String,
        channel_type: String,
    },
    /// An attach message took effect; `local` if it was ours.
    ChannelAttached {
        id: String,
        local: bool,
    },
    ChannelLoaded {
        id: String,
    },
    ChannelLoadFailed {
        id: String,
        reason: String,
    },
    /// Tasks this client should run as leader.
    LocalHelp {
        tasks: Vec<String>,
    },
    NewLeader(String),
    LeaderLeft(String),
    SaveRequested {
        sequence_number: SequenceNumber,
        contents: Value,
    },
    BlobUploaded {
        sequence_number: SequenceNumber,
        contents: Value,
    },
    RemoteHelpRequested {
        client_id: Option<String>,
        request: RemoteHelpMessage,
    },
    Closed,
}

/// A container snapshot and the stream position it was taken at.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeSnapshot {
    pub tree: SnapshotTree,
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
}

impl RuntimeSnapshot {
    pub fn load_point(&self) -> LoadPoint {
        LoadPoint::new(self.sequence_number, self.minimum_sequence_number)
    }
}

pub struct ContainerRuntime {
    config: RuntimeConfig,
    context: RuntimeContext,
    outbox: Arc<Outbox>,
    registry: ChannelRegistry,
    election: Mutex<LeaderElection>,
    members: RwLock<BTreeMap<String, MemberDetails>>,
    tasks: RwLock<Option<TaskRegistration>>,
    last_assignment: Mutex<Option<TaskAssignment>>,
    client_id: RwLock<Option<String>>,
    connection_state: RwLock<ConnectionState>,
    sequence_number: AtomicU64,
    minimum_sequence_number: AtomicU64,
    event_tx: broadcast::Sender<RuntimeEvent>,
    closed: AtomicBool,
}

impl ContainerRuntime {
    /// A runtime for a new, empty container.
    pub fn new(config: RuntimeConfig, context: RuntimeContext) -> Self {
        let outbox = Arc::new(Outbox::new(Arc::clone(&context.sink)));
        let registry = ChannelRegistry::new(Arc::clone(&context.registry), Arc::clone(&outbox));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let election = LeaderElection::new(config.leader_key.clone());

        Self {
            config,
            context,
            outbox,
            registry,
            election: Mutex::new(election),
            members: RwLock::new(BTreeMap::new()),
            tasks: RwLock::new(None),
            last_assignment: Mutex::new(None),
            client_id: RwLock::new(None),
            connection_state: RwLock::new(ConnectionState::Disconnected),
            sequence_number: AtomicU64::new(0),
            minimum_sequence_number: AtomicU64::new(0),
            event_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// A runtime for a container persisted at `point`.
    ///
    /// Each top-level subtree of `tree` is one channel. `backlog` holds the
    /// messages sequenced after the snapshot, in order. Channels that fail to
    /// load are reported through [`RuntimeEvent::ChannelLoadFailed`] and do
    /// not fail the container.
    pub async fn load(
        config: RuntimeConfig,
        context: RuntimeContext,
        tree: StoredTree,
        point: LoadPoint,
        backlog: Vec<SequencedMessage>,
    ) -> Result<Self> {
        let runtime = Self::new(config, context);
        runtime.sequence_number.store(point.sequence_number, Ordering::SeqCst);
        runtime
            .minimum_sequence_number
            .store(point.minimum_sequence_number, Ordering::SeqCst);
        runtime.outbox.processed(point.sequence_number);

        let backlog: Vec<SequencedMessage> = backlog
            .into_iter()
            .filter(|message| message.sequence_number > point.sequence_number)
            .collect();
        let backlog_end = backlog
            .iter()
            .map(|message| (message.sequence_number, message.minimum_sequence_number))
            .max();

        // Operations for stored channels are replayed by the load itself.
        let mut per_channel: HashMap<String, Vec<SequencedMessage>> = tree
            .trees
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        let mut remaining = Vec::new();
        for message in backlog {
            if message.message_type == MessageType::Operation {
                let (address, inner) = channel_message(&message)?;
                if let Some(queue) = per_channel.get_mut(&address) {
                    queue.push(inner);
                    continue;
                }
            }
            remaining.push(message);
        }

        for id in tree.trees.keys() {
            runtime.registry.begin_load(id)?;
        }

        let prefetched = Arc::new(PrefetchedStorage::new(Arc::clone(&runtime.context.storage)));
        let fetched = prefetched.prefetch_children(&tree, ATTRIBUTES_BLOB).await;
        debug!(fetched, "Prefetched channel attributes");
        let storage: Arc<dyn DocumentStorage> = prefetched;

        let loads = tree.trees.iter().map(|(id, subtree)| {
            let backlog = per_channel.remove(id).unwrap_or_default();
            let storage = Arc::clone(&storage);
            let registry = &runtime.registry;
            async move {
                let result = registry
                    .load_from_snapshot(id, subtree.clone(), storage, point, backlog)
                    .await;
                (id.clone(), result)
            }
        });
        let results = join_all(loads).await;

        for (id, result) in results {
            match result {
                Ok(_) => runtime.emit(RuntimeEvent::ChannelLoaded { id }),
                Err(RuntimeError::ChannelLoadFailed { id, reason }) => {
                    runtime.emit(RuntimeEvent::ChannelLoadFailed { id, reason });
                }
                Err(err) => return Err(err),
            }
        }

        for message in &remaining {
            runtime.process(message).await?;
        }
        // Operations replayed by the channel loads still move the stream forward.
        if let Some((last, minimum)) = backlog_end {
            runtime.sequence_number.fetch_max(last, Ordering::SeqCst);
            runtime.outbox.processed(last);
            runtime.advance_minimum(minimum);
        }

        info!(
            container = %runtime.config.container_id,
            channels = runtime.registry.ids().len(),
            sequence_number = runtime.sequence_number(),
            "Container loaded"
        );
        Ok(runtime)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::ClosedContainer);
        }
        Ok(())
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Last document sequence number processed.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number.load(Ordering::SeqCst)
    }

    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.minimum_sequence_number.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read()
    }

    /// Create a local channel from a package path such as `["Comp", "Sub"]`.
    pub async fn create_channel<I, S>(&self, id: &str, package: I) -> Result<ChannelHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        let package = PackagePath::new(package).map_err(|err| match err {
            AttributesError::EmptyPackagePath => {
                RuntimeError::MalformedPackagePath(format!("empty package path for channel {id}"))
            }
            other => other.into(),
        })?;

        let is_new = self.registry.state(id).is_none();
        let channel = self.registry.create_channel(id, package).await?;
        if is_new {
            self.emit(RuntimeEvent::ChannelCreated {
                id: id.to_string(),
                channel_type: channel.channel_type().to_string(),
            });
        }
        Ok(channel)
    }

    /// Resolves once a channel with `id` exists. Pending until then.
    pub async fn get_channel(&self, id: &str) -> Result<ChannelHandle> {
        self.ensure_open()?;
        self.registry.wait_for(id).await
    }

    /// Share a local channel. Returns the services the channel was connected
    /// with.
    pub fn attach_channel(&self, id: &str) -> Result<ChannelServices> {
        self.ensure_open()?;
        self.registry.attach_channel(id)
    }

    pub fn channel_state(&self, id: &str) -> Result<Option<ChannelState>> {
        self.ensure_open()?;
        Ok(self.registry.state(id))
    }

    pub fn channel_ids(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.registry.ids())
    }

    /// Channels that could not be loaded, with the reason.
    pub fn failed_channels(&self) -> HashMap<String, String> {
        self.registry.failed_loads()
    }

    /// Apply one sequenced message.
    ///
    /// A protocol violation closes the container.
    pub async fn process(&self, message: &SequencedMessage) -> Result<()> {
        self.ensure_open()?;
        let result = self.apply(message).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(
                    sequence_number = message.sequence_number,
                    error = %err,
                    "Closing container after protocol violation"
                );
                self.close();
            }
        }
        result
    }

    async fn apply(&self, message: &SequencedMessage) -> Result<()> {
        let sequence_number = message.sequence_number;
        if sequence_number <= self.sequence_number() {
            debug!(sequence_number, "Skipping already processed message");
            return Ok(());
        }

        match message.message_type {
            MessageType::Operation => self.registry.process_operation(message)?,
            MessageType::Attach => match self.registry.process_attach(message).await {
                Ok(AttachOutcome::Acknowledged(id)) => {
                    self.emit(RuntimeEvent::ChannelAttached { id, local: true })
                }
                Ok(AttachOutcome::Remote(id)) => {
                    self.emit(RuntimeEvent::ChannelAttached { id, local: false })
                }
                Ok(AttachOutcome::Duplicate(_)) => {}
                Err(RuntimeError::ChannelLoadFailed { id, reason }) => {
                    self.emit(RuntimeEvent::ChannelLoadFailed { id, reason })
                }
                Err(err) => return Err(err),
            },
            MessageType::Save => self.emit(RuntimeEvent::SaveRequested {
                sequence_number,
                contents: message.contents.clone(),
            }),
            MessageType::BlobUploaded => self.emit(RuntimeEvent::BlobUploaded {
                sequence_number,
                contents: message.contents.clone(),
            }),
            MessageType::RemoteHelp => {
                let request: RemoteHelpMessage = serde_json::from_value(message.contents.clone())?;
                self.emit(RuntimeEvent::RemoteHelpRequested {
                    client_id: message.client_id.clone(),
                    request,
                });
            }
        }

        self.sequence_number.fetch_max(sequence_number, Ordering::SeqCst);
        self.outbox.processed(sequence_number);
        self.advance_minimum(message.minimum_sequence_number);
        Ok(())
    }

    /// Advance the minimum sequence number on every channel.
    pub fn update_minimum_sequence_number(&self, minimum_sequence_number: SequenceNumber) -> Result<()> {
        self.ensure_open()?;
        self.advance_minimum(minimum_sequence_number);
        Ok(())
    }

    fn advance_minimum(&self, minimum_sequence_number: SequenceNumber) {
        self.minimum_sequence_number
            .fetch_max(minimum_sequence_number, Ordering::SeqCst);
        self.registry
            .update_minimum_sequence_number(minimum_sequence_number);
    }

    /// Snapshot every attached channel.
    ///
    /// With `full_tree` unset, channels unchanged since they were loaded are
    /// referenced by their stored tree id instead of being re-serialized.
    pub fn snapshot(&self, full_tree: bool) -> Result<RuntimeSnapshot> {
        self.ensure_open()?;
        self.assemble(full_tree)
    }

    fn assemble(&self, full_tree: bool) -> Result<RuntimeSnapshot> {
        let sequence_number = self.sequence_number();
        let minimum_sequence_number = self.minimum_sequence_number();
        let assembler = SnapshotAssembler::new(sequence_number, minimum_sequence_number);
        let tree = assembler.container_tree(
            &self.config.container_id,
            &self.registry.snapshot_candidates(),
            full_tree,
        )?;
        Ok(RuntimeSnapshot {
            tree,
            sequence_number,
            minimum_sequence_number,
        })
    }

    /// Snapshot of a single channel, attached or not.
    pub fn snapshot_channel(&self, id: &str) -> Result<SnapshotTree> {
        self.ensure_open()?;
        let candidate = self
            .registry
            .snapshot_candidates()
            .into_iter()
            .find(|candidate| candidate.id == id)
            .ok_or_else(|| RuntimeError::ChannelNotFound(id.to_string()))?;

        if candidate.is_included() {
            SnapshotAssembler::new(self.sequence_number(), self.minimum_sequence_number())
                .channel_tree(&candidate)
        } else {
            SnapshotAssembler::detached_tree(&candidate.channel, &candidate.package)
        }
    }

    /// Take a final snapshot and close the container.
    ///
    /// Channels whose attach was never acknowledged are not included.
    pub fn stop(&self) -> Result<RuntimeSnapshot> {
        self.ensure_open()?;
        let snapshot = self.assemble(true)?;
        if self.registry.has_unacked_ops() {
            warn!(
                pending = self.registry.pending_attaches().len(),
                "Stopping with unacknowledged local changes"
            );
        }
        self.close();
        Ok(snapshot)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(container = %self.config.container_id, "Container closed");
            self.emit(RuntimeEvent::Closed);
        }
    }

    /// Propagate connectivity to the channels and, on connect, resubmit
    /// pending attach messages and rejoin the leader election.
    ///
    /// Leaving the connected state drops the member view and any
    /// leadership this client held.
    pub async fn change_connection_state(
        &self,
        state: ConnectionState,
        client_id: Option<&str>,
    ) -> Result<()> {
        self.ensure_open()?;
        *self.connection_state.write() = state;
        if state == ConnectionState::Connected {
            *self.client_id.write() = client_id.map(str::to_string);
        }
        self.registry.set_connection_state(state, client_id)?;

        if state != ConnectionState::Connected {
            let step = self.election.lock().reset();
            self.members.write().clear();
            *self.client_id.write() = None;
            *self.last_assignment.lock() = None;
            self.perform(step).await;
            return Ok(());
        }

        let members = self.context.quorum.members();
        *self.members.write() = members.clone();
        let agreed = self.context.quorum.get(&self.config.leader_key);
        let step = {
            let mut election = self.election.lock();
            election.set_client_id(client_id.map(str::to_string));
            election.evaluate(&members, agreed.as_deref())
        };
        self.perform(step).await;
        Ok(())
    }

    pub fn has_unacked_ops(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.registry.has_unacked_ops())
    }

    /// Register the background tasks this container needs.
    ///
    /// Registering makes this client take part in the leader election; if
    /// it is already connected the election starts right away. `version`
    /// overrides the configured help version.
    pub async fn register_tasks(&self, tasks: Vec<String>, version: Option<String>) -> Result<()> {
        self.ensure_open()?;
        let version = version.or_else(|| self.config.help_version.clone());
        *self.tasks.write() = Some(TaskRegistration { tasks, version });
        *self.last_assignment.lock() = None;

        let step = if self.connection_state() == ConnectionState::Connected {
            let members = self.members.read().clone();
            let agreed = self.context.quorum.get(&self.config.leader_key);
            let mut election = self.election.lock();
            election.set_participating(true);
            election.evaluate(&members, agreed.as_deref())
        } else {
            self.election.lock().set_participating(true);
            ElectionStep::default()
        };
        self.perform(step).await;

        if self.is_leader() {
            self.analyze();
        }
        Ok(())
    }

    /// Apply a quorum membership or consensus event, in stream order.
    pub async fn process_quorum_event(&self, event: &QuorumEvent) -> Result<()> {
        self.ensure_open()?;
        let members = {
            let mut members = self.members.write();
            match event {
                QuorumEvent::MemberJoined { client_id, details } => {
                    members.insert(client_id.clone(), details.clone());
                }
                QuorumEvent::MemberLeft { client_id } => {
                    members.remove(client_id);
                }
                _ => {}
            }
            members.clone()
        };
        let step = self.election.lock().handle(event, &members);
        self.perform(step).await;
        Ok(())
    }

    async fn perform(&self, step: ElectionStep) {
        for event in step.events {
            match event {
                ElectionEvent::NewLeader(id) => {
                    info!(leader = %id, "New leader");
                    *self.last_assignment.lock() = None;
                    self.emit(RuntimeEvent::NewLeader(id));
                }
                ElectionEvent::LeaderLeft(id) => {
                    info!(leader = %id, "Leader left");
                    self.emit(RuntimeEvent::LeaderLeft(id));
                }
            }
        }

        for action in step.actions {
            match action {
                ElectionAction::Propose { key, value } => {
                    debug!(key = %key, value = %value, "Proposing leadership");
                    if let Err(err) = self.context.quorum.propose(&key, &value).await {
                        warn!(error = %err, "Leadership proposal failed");
                    }
                }
                ElectionAction::AnalyzeTasks => self.analyze(),
            }
        }
    }

    /// Run task analysis as leader. Repeating it with unchanged membership
    /// and tasks has no further effect.
    fn analyze(&self) {
        let Some(registration) = self.tasks.read().clone() else {
            return;
        };
        let Some(client_id) = self.client_id() else {
            return;
        };
        let members = self.members.read().clone();
        let Some(assignment) = analyze_tasks(&client_id, &members, &registration.tasks) else {
            return;
        };

        {
            let mut last = self.last_assignment.lock();
            if last.as_ref() == Some(&assignment) {
                return;
            }
            *last = Some(assignment.clone());
        }

        debug!(local = ?assignment.local, remote = ?assignment.remote, "Tasks analyzed");
        if !assignment.local.is_empty() {
            self.emit(RuntimeEvent::LocalHelp {
                tasks: assignment.local.clone(),
            });
        }
        if !assignment.remote.is_empty() {
            let request = RemoteHelpMessage {
                tasks: assignment.remote,
                version: registration.version,
            };
            let submitted = serde_json::to_value(&request)
                .map_err(RuntimeError::from)
                .and_then(|contents| {
                    self.outbox
                        .submit(MessageType::RemoteHelp, contents)
                        .map_err(RuntimeError::from)
                });
            match submitted {
                Ok(_) => {}
                Err(RuntimeError::Submit(SubmitError::Disconnected)) => {
                    debug!("Remote help deferred; not connected");
                    *self.last_assignment.lock() = None;
                }
                Err(err) => warn!(error = %err, "Failed to request remote help"),
            }
        }
    }

    /// Agreed leader, if any.
    pub fn leader(&self) -> Option<String> {
        self.election.lock().leader().map(str::to_string)
    }

    pub fn is_leader(&self) -> bool {
        self.election.lock().is_leader()
    }

    /// Channels whose attach has not been acknowledged yet.
    pub fn pending_attaches(&self) -> Vec<String> {
        self.registry
            .pending_attaches()
            .into_iter()
            .map(|attach| attach.id)
            .collect()
    }
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime")
            .field("container_id", &self.config.container_id)
            .field("client_id", &*self.client_id.read())
            .field("sequence_number", &self.sequence_number())
            .field("registry", &self.registry)
            .field("closed", &self.is_closed())
            .finish()
    }
}
