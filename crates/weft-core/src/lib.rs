//! Protocol types shared by every Weft crate.
//!
//! - [`message`] - the ordered document stream and its payloads
//! - [`tree`] - snapshot trees, both in-memory and as written to storage
//! - [`attributes`] - the `.attributes` blob and package paths

pub mod attributes;
pub mod message;
pub mod tree;

pub use attributes::{
    AttributesError, ChannelAttributes, PackagePath, ATTRIBUTES_BLOB, SNAPSHOT_FORMAT_VERSION,
};
pub use message::{
    AttachMessage, ConnectionState, DocumentMessage, Envelope, MessageOrigin, MessageSink,
    MessageType, RemoteHelpMessage, SequenceNumber, SequencedMessage, SubmitError,
};
pub use tree::{Blob, EntryValue, SnapshotTree, StoredTree, TreeEntry};
