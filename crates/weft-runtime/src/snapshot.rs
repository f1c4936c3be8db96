//! Snapshot assembly.
//!
//! A container snapshot nests each channel's own tree under the channel id
//! and adds an `.attributes` blob describing how to rebuild it:
//!
//! ```text
//! /
//! ├── counter-1/
//! │   ├── .attributes   {"pkg":"[\"counter\"]","snapshotFormatVersion":"0.1",...}
//! │   └── header
//! └── counter-2/ ...
//! ```
//!
//! Only channels the whole quorum can resolve are included: attached, with an
//! established base mapping. A channel whose attach message has not been
//! echoed yet is left out.

use crate::channel::{ChannelHandle, ChannelState};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;
use weft_core::attributes::{ChannelAttributes, PackagePath, ATTRIBUTES_BLOB};
use weft_core::message::SequenceNumber;
use weft_core::tree::SnapshotTree;
use weft_delta::DeltaConnection;

/// Metadata key for the document sequence number of a container snapshot.
pub const SEQUENCE_NUMBER_KEY: &str = "sequenceNumber";
/// Metadata key for the minimum sequence number of a container snapshot.
pub const MINIMUM_SEQUENCE_NUMBER_KEY: &str = "minimumSequenceNumber";
/// Metadata key for the id of the container a snapshot was taken from.
pub const CONTAINER_ID_KEY: &str = "containerId";

/// A channel as seen by the assembler.
#[derive(Clone)]
pub struct SnapshotCandidate {
    pub id: String,
    pub state: ChannelState,
    pub package: PackagePath,
    pub channel: ChannelHandle,
    pub connection: Option<Arc<DeltaConnection>>,
    /// Stored tree the channel was loaded from.
    pub stored_tree_id: Option<String>,
}

impl SnapshotCandidate {
    /// Whether this channel belongs in a container snapshot.
    pub fn is_included(&self) -> bool {
        self.state.is_attached()
            && self
                .connection
                .as_ref()
                .map(|connection| connection.is_mapped())
                .unwrap_or(false)
    }

    /// Whether no message has reached the channel since it was loaded.
    fn is_unchanged_since_load(&self) -> bool {
        match (&self.stored_tree_id, &self.connection) {
            (Some(_), Some(connection)) => connection
                .base_document_sequence_number()
                .map(|base| connection.last_document_sequence_number() == base)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Builds snapshot trees at a given point of the document stream.
#[derive(Clone, Debug)]
pub struct SnapshotAssembler {
    sequence_number: SequenceNumber,
    minimum_sequence_number: SequenceNumber,
}

impl SnapshotAssembler {
    pub fn new(sequence_number: SequenceNumber, minimum_sequence_number: SequenceNumber) -> Self {
        Self {
            sequence_number,
            minimum_sequence_number,
        }
    }

    /// Snapshot of a channel that has never been shared; used for attach.
    pub fn detached_tree(channel: &ChannelHandle, package: &PackagePath) -> Result<SnapshotTree> {
        let mut tree = channel.snapshot();
        tree.remove(ATTRIBUTES_BLOB);
        tree.add_json(ATTRIBUTES_BLOB, &ChannelAttributes::new(package)?)?;
        Ok(tree)
    }

    /// Snapshot of one channel, with attributes derived from its connection.
    pub fn channel_tree(&self, candidate: &SnapshotCandidate) -> Result<SnapshotTree> {
        let mut attributes = ChannelAttributes::new(&candidate.package)?;
        if let Some(base) = candidate.connection.as_ref().and_then(|c| c.base_mapping()) {
            let minimum = candidate
                .connection
                .as_ref()
                .map(|c| c.minimum_sequence_number())
                .unwrap_or(self.minimum_sequence_number);
            attributes = attributes
                .with_sequence_numbers(base.to_local(self.sequence_number), base.to_local(minimum))
                .at_document_sequence_number(self.sequence_number.max(base.document));
        }

        let mut tree = candidate.channel.snapshot();
        tree.remove(ATTRIBUTES_BLOB);
        tree.add_json(ATTRIBUTES_BLOB, &attributes)?;
        Ok(tree)
    }

    /// Snapshot of the whole container.
    ///
    /// With `full_tree` unset, channels loaded from storage and untouched
    /// since are emitted as handles to their stored trees.
    pub fn container_tree(
        &self,
        container_id: &str,
        candidates: &[SnapshotCandidate],
        full_tree: bool,
    ) -> Result<SnapshotTree> {
        let mut root = SnapshotTree::new()
            .with_metadata(SEQUENCE_NUMBER_KEY, self.sequence_number.to_string())
            .with_metadata(MINIMUM_SEQUENCE_NUMBER_KEY, self.minimum_sequence_number.to_string())
            .with_metadata(CONTAINER_ID_KEY, container_id);

        let mut excluded = 0;
        for candidate in candidates {
            if !candidate.is_included() {
                excluded += 1;
                continue;
            }
            match (&candidate.stored_tree_id, full_tree) {
                (Some(stored), false) if candidate.is_unchanged_since_load() => {
                    root.add_handle(candidate.id.clone(), stored.clone());
                }
                _ => root.add_tree(candidate.id.clone(), self.channel_tree(candidate)?),
            }
        }

        debug!(
            sequence_number = self.sequence_number,
            included = root.len(),
            excluded,
            full_tree,
            "Assembled container snapshot"
        );
        Ok(root)
    }
}
