//! Outbound side of the runtime.
//!
//! Stamps client sequence numbers and the last processed document sequence
//! number onto everything the container sends.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;
use weft_core::message::{
    DocumentMessage, Envelope, MessageSink, MessageType, SequenceNumber, SubmitError,
};
use weft_delta::{DeltaError, SubmitFn};

pub struct Outbox {
    sink: Arc<dyn MessageSink>,
    client_sequence_number: AtomicU64,
    reference_sequence_number: AtomicU64,
}

impl Outbox {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            client_sequence_number: AtomicU64::new(0),
            reference_sequence_number: AtomicU64::new(0),
        }
    }

    /// Send a message, returning its client sequence number.
    pub fn submit(
        &self,
        message_type: MessageType,
        contents: Value,
    ) -> Result<SequenceNumber, SubmitError> {
        let client_sequence_number = self.client_sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        let message = DocumentMessage {
            client_sequence_number,
            reference_sequence_number: self.reference_sequence_number(),
            message_type,
            contents,
        };
        trace!(csn = client_sequence_number, kind = ?message_type, "Submitting message");
        self.sink.submit(message)?;
        Ok(client_sequence_number)
    }

    /// Record that the container processed `sequence_number`.
    pub fn processed(&self, sequence_number: SequenceNumber) {
        self.reference_sequence_number
            .fetch_max(sequence_number, Ordering::SeqCst);
    }

    pub fn reference_sequence_number(&self) -> SequenceNumber {
        self.reference_sequence_number.load(Ordering::SeqCst)
    }

    /// Submit callback for the delta connection of channel `address`.
    pub fn channel_submitter(self: &Arc<Self>, address: &str) -> SubmitFn {
        let outbox = Arc::clone(self);
        let address = address.to_string();
        Arc::new(move |contents| {
            let envelope = serde_json::to_value(Envelope::new(address.clone(), contents)).map_err(
                |e| DeltaError::Submit {
                    channel: address.clone(),
                    reason: e.to_string(),
                },
            )?;
            outbox
                .submit(MessageType::Operation, envelope)
                .map_err(|e| DeltaError::Submit {
                    channel: address.clone(),
                    reason: e.to_string(),
                })
        })
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("client_sequence_number", &self.client_sequence_number)
            .field("reference_sequence_number", &self.reference_sequence_number)
            .finish_non_exhaustive()
    }
}
