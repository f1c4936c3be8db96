//! The contract every channel implementation fulfils.
//!
//! A channel is an opaque shared data structure. The runtime only needs it to
//! apply sequenced messages ([`DeltaHandler`]), to produce a snapshot of
//! itself, and to accept the services it uses to send operations and read
//! persisted state once it is shared.

use crate::error::Result;
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use weft_core::attributes::ChannelAttributes;
use weft_core::tree::SnapshotTree;
use weft_delta::{DeltaConnection, DeltaHandler};

/// Shared reference to a channel.
pub type ChannelHandle = Arc<dyn SharedChannel>;

/// Lifecycle of a channel within the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Created locally, not yet shared.
    LocalUnattached,
    /// Attach message submitted, echo not yet received.
    LocalPendingAttach,
    /// Local channel whose attach message was acknowledged.
    Attached,
    /// Being constructed from a remote snapshot.
    RemoteLoading,
    /// Constructed from a remote attach message or persisted snapshot.
    RemoteAttached,
}

impl ChannelState {
    /// Whether the rest of the quorum can resolve this channel.
    pub fn is_attached(&self) -> bool {
        matches!(self, ChannelState::Attached | ChannelState::RemoteAttached)
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ChannelState::LocalUnattached | ChannelState::LocalPendingAttach | ChannelState::Attached
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::LocalUnattached => "local-unattached",
            ChannelState::LocalPendingAttach => "local-pending-attach",
            ChannelState::Attached => "attached",
            ChannelState::RemoteLoading => "remote-loading",
            ChannelState::RemoteAttached => "remote-attached",
        };
        f.write_str(name)
    }
}

/// Services a shared channel uses to talk to the rest of the container.
#[derive(Clone)]
pub struct ChannelServices {
    pub connection: Arc<DeltaConnection>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl fmt::Debug for ChannelServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelServices")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// A shared data structure hosted by the container.
pub trait SharedChannel: DeltaHandler + 'static {
    fn id(&self) -> &str;

    /// Type identifier; matches the last element of the package path.
    fn channel_type(&self) -> &str;

    /// Current state as a tree. Must not contain an `.attributes` entry;
    /// the runtime adds its own.
    fn snapshot(&self) -> SnapshotTree;

    /// Called once the channel is shared (attached or loaded).
    fn connect(&self, services: ChannelServices);

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel")
            .field("id", &self.id())
            .field("channel_type", &self.channel_type())
            .finish()
    }
}

/// Creates channels of one type.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    fn channel_type(&self) -> &str;

    /// A fresh, empty channel.
    fn create(&self, id: &str) -> ChannelHandle;

    /// Rebuild a channel from its persisted state.
    async fn load(
        &self,
        id: &str,
        storage: &dyn ObjectStorage,
        attributes: &ChannelAttributes,
    ) -> Result<ChannelHandle>;
}

/// Borrow a channel as its concrete type.
pub fn downcast<T: SharedChannel>(channel: &ChannelHandle) -> Option<&T> {
    channel.as_any().downcast_ref::<T>()
}
