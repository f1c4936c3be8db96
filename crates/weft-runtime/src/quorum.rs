//! Quorum membership and consensus proposals.
//!
//! The quorum is the set of clients connected to a document, plus a small
//! key-value store whose values only change through proposals every member
//! agrees on. Events are delivered in document order alongside sequenced
//! messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Kind of a quorum member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientType {
    /// A user-facing client; may become leader.
    Interactive,
    /// A background worker serving a single task.
    Agent,
}

/// What a member told the quorum about itself when joining.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDetails {
    pub client_type: ClientType,
    /// Task this member is serving, for agents.
    #[serde(default)]
    pub serving: Option<String>,
    /// Tasks this member is able to run locally.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl MemberDetails {
    pub fn interactive() -> Self {
        Self {
            client_type: ClientType::Interactive,
            serving: None,
            capabilities: Vec::new(),
        }
    }

    pub fn agent(serving: impl Into<String>) -> Self {
        Self {
            client_type: ClientType::Agent,
            serving: Some(serving.into()),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.client_type == ClientType::Interactive
    }
}

/// Membership and consensus changes, in document order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumEvent {
    MemberJoined {
        client_id: String,
        details: MemberDetails,
    },
    MemberLeft {
        client_id: String,
    },
    ProposalAccepted {
        key: String,
        value: String,
    },
    ProposalRejected {
        key: String,
        value: String,
    },
}

/// Errors from quorum proposals.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuorumError {
    #[error("proposal for {key} rejected: {reason}")]
    Rejected { key: String, reason: String },

    #[error("not connected to the quorum")]
    Disconnected,
}

/// Quorum as seen by one client.
#[async_trait]
pub trait Quorum: Send + Sync {
    /// Current members by client id.
    fn members(&self) -> BTreeMap<String, MemberDetails>;

    /// Agreed value of `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Propose a value for `key`. Resolves once the quorum has decided.
    async fn propose(&self, key: &str, value: &str) -> Result<(), QuorumError>;
}
