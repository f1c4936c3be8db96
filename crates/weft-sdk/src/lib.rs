//! Weft SDK - in-process harness for the container runtime
//!
//! The runtime only talks to the outside world through a message sink, a
//! quorum, a blob store and a factory registry. This crate provides in-memory
//! versions of all of them and a [`Client`] that wires one runtime to them.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use weft_sdk::prelude::*;
//!
//! # async fn demo() -> weft_sdk::Result<()> {
//! let orderer = MemoryOrderer::new();
//! let alice = Client::with_defaults(ClientConfig::default(), orderer.clone());
//! let bob = Client::with_defaults(ClientConfig::default(), orderer.clone());
//! alice.connect().await?;
//! bob.connect().await?;
//!
//! let counter = alice.create_counter("clicks").await?;
//! as_counter(&counter)?.increment(5)?;
//! alice.sync().await?;
//! bob.sync().await?;
//!
//! let seen = bob.get_channel("clicks").await?;
//! assert_eq!(as_counter(&seen)?.value(), 5);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ordering`] - sequencing, quorum membership and proposals, history and
//!   saved snapshots
//! - [`client`] - a runtime connected to the orderer through a dispatch task
//! - [`channels`] - the reference [`CounterChannel`]
//! - [`error`] - Error types

pub mod channels;
pub mod client;
pub mod error;
pub mod ordering;

pub use channels::{as_counter, default_registry, CounterChannel, CounterFactory, COUNTER_TYPE};
pub use client::{Client, ClientConfig, ClientConfigBuilder};
pub use error::{Result, SdkError};
pub use ordering::{Delivery, DeliveryPayload, MemoryOrderer, OrdererLink, SavedSnapshot};

pub use weft_runtime::{ContainerRuntime, MemberDetails, RuntimeEvent};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channels::{as_counter, CounterChannel};
    pub use crate::client::{Client, ClientConfig, ClientConfigBuilder};
    pub use crate::error::SdkError;
    pub use crate::ordering::MemoryOrderer;
    pub use weft_runtime::{ChannelState, MemberDetails, RuntimeEvent};
}
