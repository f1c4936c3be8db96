//! Task distribution.
//!
//! The leader decides which background tasks nobody is serving yet, runs
//! what it can itself and asks for external help with the rest.

use crate::quorum::{ClientType, MemberDetails};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Tasks registered by the host, with the version advertised to helpers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRegistration {
    pub tasks: Vec<String>,
    pub version: Option<String>,
}

/// Outcome of task analysis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Tasks the leader runs itself.
    pub local: Vec<String>,
    /// Tasks an external agent should pick up.
    pub remote: Vec<String>,
}

impl TaskAssignment {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}

/// Split `tasks` not already served by an agent between `client_id` and
/// remote helpers.
///
/// Returns `None` if `client_id` is not a member. Task order is preserved.
pub fn analyze_tasks(
    client_id: &str,
    members: &BTreeMap<String, MemberDetails>,
    tasks: &[String],
) -> Option<TaskAssignment> {
    let leader = members.get(client_id)?;

    let served: HashSet<&str> = members
        .values()
        .filter(|member| member.client_type == ClientType::Agent)
        .filter_map(|member| member.serving.as_deref())
        .collect();
    let capable: HashSet<&str> = leader.capabilities.iter().map(String::as_str).collect();

    let mut assignment = TaskAssignment::default();
    for task in tasks.iter().filter(|task| !served.contains(task.as_str())) {
        if capable.contains(task.as_str()) {
            assignment.local.push(task.clone());
        } else {
            assignment.remote.push(task.clone());
        }
    }
    Some(assignment)
}
