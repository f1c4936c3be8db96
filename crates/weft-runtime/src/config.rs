//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Quorum key leadership proposals are made against.
pub const DEFAULT_LEADER_KEY: &str = "leader";

/// Configuration for a [`ContainerRuntime`](crate::ContainerRuntime).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Id of the container this runtime serves.
    pub container_id: String,
    /// Version tag attached to remote-help requests when `register_tasks`
    /// does not supply one.
    pub help_version: Option<String>,
    /// Quorum key used for leadership proposals.
    pub leader_key: String,
    /// Capacity of the runtime event channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            container_id: "default".to_string(),
            help_version: None,
            leader_key: DEFAULT_LEADER_KEY.to_string(),
            event_capacity: 100,
        }
    }
}

/// Builder for runtime configuration.
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.config.container_id = id.into();
        self
    }

    pub fn help_version(mut self, version: impl Into<String>) -> Self {
        self.config.help_version = Some(version.into());
        self
    }

    pub fn leader_key(mut self, key: impl Into<String>) -> Self {
        self.config.leader_key = key.into();
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
