//! High-level client for a Weft document.
//!
//! A [`Client`] owns one [`ContainerRuntime`] and connects it to a
//! [`MemoryOrderer`]: outbound messages and proposals go through an
//! [`OrdererLink`], and a dispatch task feeds the client's ordered stream
//! back into the runtime one delivery at a time.

use crate::channels::{default_registry, COUNTER_TYPE};
use crate::error::{Result, SdkError};
use crate::ordering::{Delivery, DeliveryPayload, MemoryOrderer, OrdererLink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use weft_core::message::ConnectionState;
use weft_core::tree::StoredTree;
use weft_runtime::{
    ChannelHandle, ContainerRuntime, FactoryRegistry, MemberDetails, RuntimeConfig,
    RuntimeContext, RuntimeEvent, RuntimeSnapshot,
};

/// Configuration for a Weft client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// User name, for logs.
    pub user_name: String,
    /// What this client announces when joining the quorum.
    pub member: MemberDetails,
    /// Background tasks registered on connect. A client with tasks takes
    /// part in the leader election.
    pub tasks: Vec<String>,
    /// Configuration of the hosted container runtime.
    pub runtime: RuntimeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_name: "Anonymous".to_string(),
            member: MemberDetails::interactive(),
            tasks: Vec::new(),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.config.user_name = name.into();
        self
    }

    pub fn member(mut self, details: MemberDetails) -> Self {
        self.config.member = details;
        self
    }

    /// Join as an agent serving `task`.
    pub fn agent(mut self, task: impl Into<String>) -> Self {
        self.config.member = MemberDetails::agent(task);
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.member = self.config.member.with_capabilities(capabilities);
        self
    }

    pub fn tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.config.runtime.container_id = id.into();
        self
    }

    pub fn help_version(mut self, version: impl Into<String>) -> Self {
        self.config.runtime.help_version = Some(version.into());
        self
    }

    pub fn runtime(mut self, config: RuntimeConfig) -> Self {
        self.config.runtime = config;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Connection {
    client_id: String,
    progress: watch::Receiver<u64>,
    dispatch: JoinHandle<()>,
}

/// A client of one document.
///
/// # Example
///
/// ```rust,no_run
/// use weft_sdk::{as_counter, Client, ClientConfig, MemoryOrderer};
///
/// # async fn demo() -> weft_sdk::Result<()> {
/// let orderer = MemoryOrderer::new();
/// let alice = Client::with_defaults(ClientConfig::default(), orderer.clone());
/// alice.connect().await?;
///
/// let votes = alice.create_counter("votes").await?;
/// as_counter(&votes)?.increment(1)?;
/// alice.sync().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    orderer: Arc<MemoryOrderer>,
    link: Arc<OrdererLink>,
    runtime: Arc<ContainerRuntime>,
    connection: Mutex<Option<Connection>>,
}

impl Client {
    /// A client hosting a new, empty container.
    pub fn new(
        config: ClientConfig,
        orderer: Arc<MemoryOrderer>,
        registry: Arc<dyn FactoryRegistry>,
    ) -> Self {
        let link = Arc::new(OrdererLink::new(Arc::clone(&orderer)));
        let context = Self::context(&orderer, &link, registry);
        let runtime = Arc::new(ContainerRuntime::new(config.runtime.clone(), context));
        Self::assemble(config, orderer, link, runtime)
    }

    /// A new-container client resolving the SDK's own channel types.
    pub fn with_defaults(config: ClientConfig, orderer: Arc<MemoryOrderer>) -> Self {
        Self::new(config, orderer, Arc::new(default_registry()))
    }

    /// A client for the document as the orderer has it: its latest saved
    /// snapshot plus every message sequenced since.
    pub async fn load(
        config: ClientConfig,
        orderer: Arc<MemoryOrderer>,
        registry: Arc<dyn FactoryRegistry>,
    ) -> Result<Self> {
        let link = Arc::new(OrdererLink::new(Arc::clone(&orderer)));
        let context = Self::context(&orderer, &link, registry);
        let (tree, point) = orderer
            .latest_snapshot()
            .map(|saved| (saved.tree, saved.point))
            .unwrap_or_default();
        let backlog = orderer.messages_after(point.sequence_number);
        debug!(
            user = %config.user_name,
            snapshot_at = point.sequence_number,
            backlog = backlog.len(),
            "Loading document"
        );

        let runtime =
            ContainerRuntime::load(config.runtime.clone(), context, tree, point, backlog).await?;
        Ok(Self::assemble(config, orderer, link, Arc::new(runtime)))
    }

    fn context(
        orderer: &Arc<MemoryOrderer>,
        link: &Arc<OrdererLink>,
        registry: Arc<dyn FactoryRegistry>,
    ) -> RuntimeContext {
        RuntimeContext {
            sink: link.clone(),
            quorum: link.clone(),
            storage: orderer.storage(),
            registry,
        }
    }

    fn assemble(
        config: ClientConfig,
        orderer: Arc<MemoryOrderer>,
        link: Arc<OrdererLink>,
        runtime: Arc<ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            orderer,
            link,
            runtime,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user_name(&self) -> &str {
        &self.config.user_name
    }

    pub fn runtime(&self) -> &Arc<ContainerRuntime> {
        &self.runtime
    }

    pub fn orderer(&self) -> &Arc<MemoryOrderer> {
        &self.orderer
    }

    /// Quorum id of the current connection.
    pub fn client_id(&self) -> Option<String> {
        self.link.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.runtime.subscribe()
    }

    /// Join the quorum and start applying the document stream.
    ///
    /// Messages sequenced while this client was away are applied first.
    /// Returns the new client id.
    pub async fn connect(&self) -> Result<String> {
        if let Some(client_id) = self.client_id() {
            return Ok(client_id);
        }

        let (client_id, position, deliveries) = self.orderer.connect(self.config.member.clone())?;
        self.link.set_client_id(Some(client_id.clone()));

        for message in self.orderer.messages_after(self.runtime.sequence_number()) {
            self.runtime.process(&message).await?;
        }
        if !self.config.tasks.is_empty() {
            self.runtime
                .register_tasks(self.config.tasks.clone(), None)
                .await?;
        }
        self.runtime
            .change_connection_state(ConnectionState::Connected, Some(&client_id))
            .await?;

        let (progress_tx, progress) = watch::channel(position);
        let dispatch = tokio::spawn(dispatch(
            Arc::clone(&self.runtime),
            deliveries,
            progress_tx,
        ));
        *self.connection.lock() = Some(Connection {
            client_id: client_id.clone(),
            progress,
            dispatch,
        });

        info!(user = %self.config.user_name, client = %client_id, "Connected");
        Ok(client_id)
    }

    /// Leave the quorum. Pending local changes are kept for the next connect.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };

        self.link.set_client_id(None);
        self.orderer.disconnect(&connection.client_id);
        connection
            .dispatch
            .await
            .map_err(|e| SdkError::Internal(e.to_string()))?;

        if !self.runtime.is_closed() {
            self.runtime
                .change_connection_state(ConnectionState::Disconnected, None)
                .await?;
        }
        info!(user = %self.config.user_name, client = %connection.client_id, "Disconnected");
        Ok(())
    }

    /// Wait until every delivery is applied and applying them produced no
    /// new ones.
    pub async fn sync(&self) -> Result<()> {
        let mut progress = self
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.progress.clone())
            .ok_or(SdkError::NotConnected)?;

        loop {
            let target = self.orderer.position();
            let reached = progress.wait_for(|position| *position >= target).await;
            match reached {
                Ok(_) if self.orderer.position() == target => return Ok(()),
                Ok(_) => {}
                Err(_) if self.runtime.is_closed() => {
                    return Err(SdkError::Runtime("container is closed".to_string()))
                }
                Err(_) => return Err(SdkError::NotConnected),
            }
        }
    }

    /// Create a counter channel and share it.
    pub async fn create_counter(&self, id: &str) -> Result<ChannelHandle> {
        let channel = self.runtime.create_channel(id, [COUNTER_TYPE]).await?;
        self.runtime.attach_channel(id)?;
        Ok(channel)
    }

    /// Resolves once a channel with `id` exists.
    pub async fn get_channel(&self, id: &str) -> Result<ChannelHandle> {
        Ok(self.runtime.get_channel(id).await?)
    }

    /// Upload a snapshot of the container as the document's latest.
    ///
    /// Channels unchanged since they were loaded are stored by reference.
    pub fn save(&self) -> Result<StoredTree> {
        let snapshot = self.runtime.snapshot(false)?;
        self.orderer.save(&snapshot.tree, snapshot.load_point())
    }

    /// Disconnect and close the container, returning its final snapshot.
    pub async fn close(&self) -> Result<RuntimeSnapshot> {
        self.disconnect().await?;
        Ok(self.runtime.stop()?)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.lock().take() {
            self.orderer.disconnect(&connection.client_id);
            connection.dispatch.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("user_name", &self.config.user_name)
            .field("client_id", &self.client_id())
            .field("runtime", &self.runtime)
            .finish()
    }
}

/// Apply one client's deliveries in order until the stream ends or the
/// container closes.
async fn dispatch(
    runtime: Arc<ContainerRuntime>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    progress: watch::Sender<u64>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let result = match &delivery.payload {
            DeliveryPayload::Sequenced(message) => runtime.process(message).await,
            DeliveryPayload::Quorum(event) => runtime.process_quorum_event(event).await,
        };

        if let Err(err) = result {
            if runtime.is_closed() {
                error!(position = delivery.position, error = %err, "Stopping dispatch");
                return;
            }
            warn!(position = delivery.position, error = %err, "Delivery failed");
        }
        progress.send_replace(delivery.position);
    }
    debug!("Delivery stream ended");
}

/// Convenience functions for quickly setting up several clients.
pub mod quick {
    use super::*;

    /// Connect one interactive client per name to a shared orderer.
    pub async fn create_connected_clients(
        orderer: &Arc<MemoryOrderer>,
        user_names: &[&str],
    ) -> Result<Vec<Client>> {
        create_task_clients(orderer, user_names, &[]).await
    }

    /// Like [`create_connected_clients`], but every client can run and
    /// registers `tasks`, so the clients elect a leader among themselves.
    pub async fn create_task_clients(
        orderer: &Arc<MemoryOrderer>,
        user_names: &[&str],
        tasks: &[&str],
    ) -> Result<Vec<Client>> {
        let mut clients = Vec::with_capacity(user_names.len());
        for name in user_names {
            let config = ClientConfigBuilder::new()
                .user_name(*name)
                .capabilities(tasks.iter().copied())
                .tasks(tasks.iter().copied())
                .build();
            let client = Client::with_defaults(config, Arc::clone(orderer));
            client.connect().await?;
            clients.push(client);
        }
        Ok(clients)
    }
}
