//! Runtime configuration of the agent

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Everything the agent needs to run, resolved from flags and environment
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    /// Name the agent registers under with the device
    pub agent_name: String,
    /// Base URL of the device management service
    pub device_url: String,
    /// Telemetry root every published path lives under
    pub yang_root: String,
    /// Config roots whose committed changes are applied
    pub watched_roots: Vec<String>,
    pub network_instance: String,
    /// Kubernetes node the agent runs on
    pub node_name: Option<String>,
    pub pod_count_interval: Duration,
    pub register_timeout: Duration,
    /// Attempts for stream setup and consecutive stream read failures
    pub stream_max_attempts: u32,
    pub api_port: u16,
    pub queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "kbutler".to_string(),
            device_url: "http://localhost:50053".to_string(),
            yang_root: ".kbutler".to_string(),
            watched_roots: Vec::new(),
            network_instance: "default".to_string(),
            node_name: None,
            pod_count_interval: Duration::from_secs(5),
            register_timeout: Duration::from_secs(5),
            stream_max_attempts: 5,
            api_port: 8080,
            queue_capacity: 256,
        }
    }
}

impl AgentConfig {
    /// Watched roots, falling back to the telemetry root
    pub fn effective_roots(&self) -> Vec<String> {
        if self.watched_roots.is_empty() {
            vec![self.yang_root.clone()]
        } else {
            self.watched_roots.clone()
        }
    }

    pub fn stream_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.stream_max_attempts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_name.is_empty() {
            return Err(Error::ConfigError("agent name must not be empty".to_string()));
        }
        if !self.yang_root.starts_with('.') {
            return Err(Error::ConfigError(format!(
                "telemetry root {} must start with '.'",
                self.yang_root
            )));
        }
        if let Some(root) = self.watched_roots.iter().find(|r| !r.starts_with('.')) {
            return Err(Error::ConfigError(format!(
                "watched root {} must start with '.'",
                root
            )));
        }
        if !self.device_url.starts_with("http://") && !self.device_url.starts_with("https://") {
            return Err(Error::ConfigError(format!(
                "device url {} must be http(s)",
                self.device_url
            )));
        }
        if self.pod_count_interval.is_zero() || self.register_timeout.is_zero() {
            return Err(Error::ConfigError("intervals must be positive".to_string()));
        }
        if self.stream_max_attempts == 0 {
            return Err(Error::ConfigError(
                "stream max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
