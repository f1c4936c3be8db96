//! Weft Runtime - the container side of the synchronization core
//!
//! A container hosts independently addressable shared data structures
//! ("channels") and keeps them in step with one ordered, document-wide
//! message stream.
//!
//! ## Architecture
//!
//! ```text
//!  ordering service ──sequenced──► ContainerRuntime::process
//!        ▲                              │
//!        │                              ├─► ChannelRegistry ─► DeltaConnection ─► channel
//!        │                              └─► LeaderElection ──► analyze_tasks
//!        │
//!   MessageSink ◄── Outbox ◄── channel submits, attach messages, remote help
//! ```
//!
//! - [`registry`] - channel lifecycle: create, attach, remote construction,
//!   loading from storage
//! - [`snapshot`] - container and channel snapshot trees
//! - [`election`] / [`tasks`] - leader election and background task
//!   distribution
//! - [`storage`] - storage views and an in-memory content-addressed store
//! - [`factory`] - package path resolution through nested registries

pub mod channel;
pub mod config;
pub mod election;
pub mod error;
pub mod factory;
pub mod outbox;
pub mod quorum;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod storage;
pub mod tasks;

pub use channel::{downcast, ChannelFactory, ChannelHandle, ChannelServices, ChannelState, SharedChannel};
pub use config::{RuntimeConfig, RuntimeConfigBuilder, DEFAULT_LEADER_KEY};
pub use election::{ElectionAction, ElectionEvent, ElectionStep, LeaderElection, LeaderState};
pub use error::{Result, RuntimeError};
pub use factory::{resolve_package, FactoryRegistry, MemoryRegistry, RegistryEntry};
pub use outbox::Outbox;
pub use quorum::{ClientType, MemberDetails, Quorum, QuorumError, QuorumEvent};
pub use registry::{AttachOutcome, ChannelRegistry, LoadPoint};
pub use runtime::{ContainerRuntime, RuntimeContext, RuntimeEvent, RuntimeSnapshot};
pub use snapshot::{SnapshotAssembler, SnapshotCandidate};
pub use storage::{
    ChannelStorage, DocumentStorage, MemoryBlobStore, ObjectStorage, PrefetchedStorage,
    SnapshotStorage, StorageError,
};
pub use tasks::{analyze_tasks, TaskAssignment, TaskRegistration};
