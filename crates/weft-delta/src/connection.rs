//! Delta connection: sequence-number translator and operation router for
//! a single channel.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use weft_core::message::{ConnectionState, SequenceNumber, SequencedMessage};

/// Callback used to send channel operations to the ordering service.
///
/// Returns the client sequence number assigned to the submission.
pub type SubmitFn = Arc<dyn Fn(Value) -> Result<SequenceNumber, DeltaError> + Send + Sync>;

/// Errors raised by a delta connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("base mapping already set for channel {0}")]
    BaseMappingAlreadySet(String),

    #[error("no base mapping established for channel {0}")]
    BaseMappingMissing(String),

    #[error("channel {0} is not connected")]
    NotConnected(String),

    #[error("submit failed for channel {channel}: {reason}")]
    Submit { channel: String, reason: String },

    #[error("channel {channel} failed to process message {sequence_number}: {reason}")]
    Handler {
        channel: String,
        sequence_number: SequenceNumber,
        reason: String,
    },
}

impl DeltaError {
    /// Errors that mean the message stream or replay order is corrupt.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DeltaError::BaseMappingAlreadySet(_) | DeltaError::BaseMappingMissing(_)
        )
    }
}

/// Anchor between document and channel-local numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMapping {
    pub local: SequenceNumber,
    pub document: SequenceNumber,
}

impl BaseMapping {
    pub fn new(local: SequenceNumber, document: SequenceNumber) -> Self {
        Self { local, document }
    }

    /// Mapping for a channel whose attach message was sequenced at `document`.
    pub fn attach(document: SequenceNumber) -> Self {
        Self::new(0, document)
    }

    /// Translate a document sequence number into local space.
    pub fn to_local(&self, document: SequenceNumber) -> SequenceNumber {
        if document <= self.document {
            self.local
        } else {
            self.local + (document - self.document)
        }
    }
}

/// The channel side of a delta connection.
///
/// Implementations use interior mutability; the connection never holds its
/// own lock while calling into the handler, so handlers may submit from
/// inside these callbacks.
pub trait DeltaHandler: Send + Sync {
    /// Apply a sequenced message, already translated into local space.
    fn process(&self, message: &SequencedMessage, local: bool) -> Result<(), DeltaError>;

    /// The local minimum sequence number advanced.
    fn min_sequence_number_changed(&self, minimum_sequence_number: SequenceNumber);

    /// Connectivity changed; resend pending local operations on reconnect.
    fn set_connection_state(&self, state: ConnectionState);
}

#[derive(Debug)]
struct DeltaState {
    base: Option<BaseMapping>,
    /// Document-space low-water mark.
    minimum_sequence_number: SequenceNumber,
    connection_state: ConnectionState,
    unacked: u64,
    last_document_sequence_number: SequenceNumber,
}

/// Per-channel translator between document and local sequence numbers.
pub struct DeltaConnection {
    channel_id: String,
    submit_fn: SubmitFn,
    state: RwLock<DeltaState>,
}

impl DeltaConnection {
    pub fn new(
        channel_id: impl Into<String>,
        connection_state: ConnectionState,
        submit_fn: SubmitFn,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            submit_fn,
            state: RwLock::new(DeltaState {
                base: None,
                minimum_sequence_number: 0,
                connection_state,
                unacked: 0,
                last_document_sequence_number: 0,
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Anchor local numbering. Fails if a mapping already exists.
    pub fn set_base_mapping(
        &self,
        mapping: BaseMapping,
        minimum_sequence_number: SequenceNumber,
    ) -> Result<(), DeltaError> {
        let mut state = self.state.write();
        if state.base.is_some() {
            return Err(DeltaError::BaseMappingAlreadySet(self.channel_id.clone()));
        }
        state.base = Some(mapping);
        state.minimum_sequence_number = minimum_sequence_number;
        state.last_document_sequence_number = mapping.document;
        debug!(
            channel = %self.channel_id,
            local = mapping.local,
            document = mapping.document,
            msn = minimum_sequence_number,
            "Base mapping established"
        );
        Ok(())
    }

    pub fn base_mapping(&self) -> Option<BaseMapping> {
        self.state.read().base
    }

    pub fn is_mapped(&self) -> bool {
        self.state.read().base.is_some()
    }

    /// Document sequence number at which local numbering is anchored.
    pub fn base_document_sequence_number(&self) -> Option<SequenceNumber> {
        self.state.read().base.map(|base| base.document)
    }

    /// Translate a document sequence number into local space.
    pub fn to_local(&self, document: SequenceNumber) -> Result<SequenceNumber, DeltaError> {
        self.state
            .read()
            .base
            .map(|base| base.to_local(document))
            .ok_or_else(|| DeltaError::BaseMappingMissing(self.channel_id.clone()))
    }

    /// Rewrite a document message into the channel's local numbering.
    pub fn translate_to_local(
        &self,
        message: &SequencedMessage,
    ) -> Result<SequencedMessage, DeltaError> {
        let base = self
            .base_mapping()
            .ok_or_else(|| DeltaError::BaseMappingMissing(self.channel_id.clone()))?;

        let mut translated = message.clone();
        translated.sequence_number = base.to_local(message.sequence_number);
        translated.reference_sequence_number = base.to_local(message.reference_sequence_number);
        translated.minimum_sequence_number = base.to_local(message.minimum_sequence_number);
        Ok(translated)
    }

    /// Translate `message` and hand it to `handler`, then advance the MSN.
    pub fn process<H: DeltaHandler + ?Sized>(
        &self,
        handler: &H,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<(), DeltaError> {
        let translated = self.translate_to_local(message)?;
        trace!(
            channel = %self.channel_id,
            document = message.sequence_number,
            local_seq = translated.sequence_number,
            local,
            "Routing message"
        );

        handler.process(&translated, local)?;

        {
            let mut state = self.state.write();
            state.last_document_sequence_number =
                state.last_document_sequence_number.max(message.sequence_number);
            if local {
                state.unacked = state.unacked.saturating_sub(1);
            }
        }

        self.update_minimum_sequence_number(handler, message.minimum_sequence_number);
        Ok(())
    }

    /// Advance the low-water mark.
    ///
    /// Ignored before the base mapping exists and for values that do not
    /// advance it. Returns whether the handler was notified.
    pub fn update_minimum_sequence_number<H: DeltaHandler + ?Sized>(
        &self,
        handler: &H,
        minimum_sequence_number: SequenceNumber,
    ) -> bool {
        let local = {
            let mut state = self.state.write();
            let Some(base) = state.base else {
                return false;
            };
            if minimum_sequence_number <= state.minimum_sequence_number {
                return false;
            }
            state.minimum_sequence_number = minimum_sequence_number;
            base.to_local(minimum_sequence_number)
        };
        handler.min_sequence_number_changed(local);
        true
    }

    /// Document-space minimum sequence number.
    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.state.read().minimum_sequence_number
    }

    /// Highest document sequence number routed through this connection.
    pub fn last_document_sequence_number(&self) -> SequenceNumber {
        self.state.read().last_document_sequence_number
    }

    /// Propagate a connectivity change to the channel.
    pub fn set_connection_state<H: DeltaHandler + ?Sized>(
        &self,
        handler: &H,
        connection_state: ConnectionState,
    ) {
        {
            let mut state = self.state.write();
            if state.connection_state == connection_state {
                return;
            }
            state.connection_state = connection_state;
            if connection_state == ConnectionState::Disconnected {
                // Anything in flight is resent by the channel on reconnect.
                state.unacked = 0;
            }
        }
        debug!(channel = %self.channel_id, state = ?connection_state, "Connection state changed");
        handler.set_connection_state(connection_state);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Send a channel operation.
    pub fn submit(&self, contents: Value) -> Result<SequenceNumber, DeltaError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(DeltaError::NotConnected(self.channel_id.clone()));
        }
        let client_sequence_number = (self.submit_fn)(contents)?;
        self.state.write().unacked += 1;
        Ok(client_sequence_number)
    }

    /// Whether locally submitted operations are still awaiting their echo.
    pub fn is_dirty(&self) -> bool {
        self.state.read().unacked > 0
    }
}

impl std::fmt::Debug for DeltaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaConnection")
            .field("channel_id", &self.channel_id)
            .field("state", &*self.state.read())
            .finish()
    }
}
