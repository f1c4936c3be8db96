//! Reference channel types.
//!
//! [`CounterChannel`] is a shared integer. Increments commute, so applying
//! them in sequence order on every client converges without any merge logic.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tracing::trace;
use weft_core::attributes::ChannelAttributes;
use weft_core::message::{ConnectionState, SequenceNumber, SequencedMessage};
use weft_core::tree::SnapshotTree;
use weft_delta::{DeltaError, DeltaHandler};
use weft_runtime::{
    ChannelFactory, ChannelHandle, ChannelServices, MemoryRegistry, ObjectStorage, RuntimeError,
    SharedChannel,
};

use crate::error::{Result, SdkError};

/// Type name of [`CounterChannel`].
pub const COUNTER_TYPE: &str = "counter";

const VALUE_BLOB: &str = "value";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CounterOp {
    increment: i64,
}

#[derive(Debug, Default)]
struct CounterState {
    value: i64,
    /// Local increments not yet sequenced.
    pending: i64,
    last_sequence_number: SequenceNumber,
}

/// A shared integer counter.
pub struct CounterChannel {
    id: String,
    state: Mutex<CounterState>,
    services: Mutex<Option<ChannelServices>>,
}

impl CounterChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_value(id, 0)
    }

    fn with_value(id: impl Into<String>, value: i64) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(CounterState {
                value,
                ..Default::default()
            }),
            services: Mutex::new(None),
        }
    }

    /// Sequenced value.
    pub fn value(&self) -> i64 {
        self.state.lock().value
    }

    /// Sequenced value plus local increments awaiting their echo.
    pub fn optimistic_value(&self) -> i64 {
        let state = self.state.lock();
        state.value + state.pending
    }

    /// Local sequence number of the last applied increment.
    pub fn last_sequence_number(&self) -> SequenceNumber {
        self.state.lock().last_sequence_number
    }

    /// Increment the counter.
    ///
    /// Before the channel is attached the change is applied directly and
    /// travels with the attach snapshot.
    pub fn increment(&self, amount: i64) -> Result<()> {
        let connection = self
            .services
            .lock()
            .as_ref()
            .map(|services| Arc::clone(&services.connection));

        let Some(connection) = connection else {
            self.state.lock().value += amount;
            return Ok(());
        };

        let contents = serde_json::to_value(CounterOp { increment: amount })?;
        connection.submit(contents)?;
        self.state.lock().pending += amount;
        Ok(())
    }
}

impl DeltaHandler for CounterChannel {
    fn process(&self, message: &SequencedMessage, local: bool) -> std::result::Result<(), DeltaError> {
        let op: CounterOp =
            serde_json::from_value(message.contents.clone()).map_err(|e| DeltaError::Handler {
                channel: self.id.clone(),
                sequence_number: message.sequence_number,
                reason: e.to_string(),
            })?;

        let mut state = self.state.lock();
        state.value += op.increment;
        if local {
            state.pending -= op.increment;
        }
        state.last_sequence_number = message.sequence_number;
        trace!(channel = %self.id, value = state.value, "Counter incremented");
        Ok(())
    }

    fn min_sequence_number_changed(&self, _minimum_sequence_number: SequenceNumber) {}

    fn set_connection_state(&self, state: ConnectionState) {
        trace!(channel = %self.id, state = ?state, "Counter connection changed");
    }
}

impl SharedChannel for CounterChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> &str {
        COUNTER_TYPE
    }

    fn snapshot(&self) -> SnapshotTree {
        let mut tree = SnapshotTree::new();
        tree.add_blob(VALUE_BLOB, self.value().to_string().into_bytes());
        tree
    }

    fn connect(&self, services: ChannelServices) {
        *self.services.lock() = Some(services);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for [`CounterChannel`].
#[derive(Debug, Default)]
pub struct CounterFactory;

#[async_trait]
impl ChannelFactory for CounterFactory {
    fn channel_type(&self) -> &str {
        COUNTER_TYPE
    }

    fn create(&self, id: &str) -> ChannelHandle {
        Arc::new(CounterChannel::new(id))
    }

    async fn load(
        &self,
        id: &str,
        storage: &dyn ObjectStorage,
        _attributes: &ChannelAttributes,
    ) -> std::result::Result<ChannelHandle, RuntimeError> {
        let bytes = storage.read(VALUE_BLOB).await?;
        let value = String::from_utf8_lossy(&bytes)
            .trim()
            .parse::<i64>()
            .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        Ok(Arc::new(CounterChannel::with_value(id, value)))
    }
}

/// Registry resolving the channel types shipped with the SDK.
pub fn default_registry() -> MemoryRegistry {
    MemoryRegistry::new().with_factory(Arc::new(CounterFactory))
}

/// Borrow `channel` as a counter.
pub fn as_counter(channel: &ChannelHandle) -> Result<&CounterChannel> {
    weft_runtime::downcast::<CounterChannel>(channel)
        .ok_or_else(|| SdkError::ChannelNotFound(format!("{} is not a counter", channel.id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::attributes::PackagePath;
    use weft_core::message::MessageType;
    use weft_runtime::SnapshotStorage;

    fn increment(sequence_number: SequenceNumber, amount: i64) -> SequencedMessage {
        SequencedMessage {
            client_id: Some("a".into()),
            sequence_number,
            minimum_sequence_number: 0,
            client_sequence_number: 1,
            reference_sequence_number: 0,
            message_type: MessageType::Operation,
            contents: json!({ "increment": amount }),
            origin: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_detached_increment_applies_directly() {
        let counter = CounterChannel::new("c");
        counter.increment(3).unwrap();
        assert_eq!(counter.value(), 3);
        assert_eq!(counter.optimistic_value(), 3);
    }

    #[test]
    fn test_process_applies_increments() {
        let counter = CounterChannel::new("c");
        counter.process(&increment(1, 2), false).unwrap();
        counter.process(&increment(2, -5), false).unwrap();
        assert_eq!(counter.value(), -3);
        assert_eq!(counter.last_sequence_number(), 2);
    }

    #[test]
    fn test_malformed_op_is_handler_error() {
        let counter = CounterChannel::new("c");
        let mut message = increment(1, 0);
        message.contents = json!({ "decrement": 1 });
        assert!(matches!(
            counter.process(&message, false),
            Err(DeltaError::Handler { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let counter = CounterChannel::new("c");
        counter.increment(42).unwrap();

        let storage = SnapshotStorage::new(counter.snapshot());
        let attributes = ChannelAttributes::new(&PackagePath::new([COUNTER_TYPE]).unwrap()).unwrap();
        let loaded = CounterFactory
            .load("c", &storage, &attributes)
            .await
            .unwrap();
        assert_eq!(as_counter(&loaded).unwrap().value(), 42);
    }
}
