//! Error types for the reach agent

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Kubernetes watch stream error
    #[error("Kubernetes watch error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    /// HTTP transport towards the device failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The device answered a call with an error
    #[error("Device RPC error: {0}")]
    DeviceRpc(String),

    /// Outbound payload could not be encoded
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Inbound device data could not be decoded
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Agent registration with the device failed
    #[error("Agent registration failed: {0}")]
    RegistrationError(String),

    /// The notification stream could not be established or read
    #[error("Notification stream error: {0}")]
    StreamError(String),

    /// An internal channel closed while work was still pending
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Invalid agent configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    /// Errors that mean the agent can no longer fulfil its base contract.
    ///
    /// The process stops instead of degrading silently when one of these
    /// reaches the top of a task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RegistrationError(_)
                | Error::StreamError(_)
                | Error::SerializationError(_)
                | Error::ChannelClosed(_)
                | Error::ConfigError(_)
                | Error::TaskFailed(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) | Error::WatchError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::DeviceRpc(_) => "device",
            Error::SerializationError(_) => "serialization",
            Error::DecodeError(_) => "decode",
            Error::RegistrationError(_) => "registration",
            Error::StreamError(_) => "stream",
            Error::ChannelClosed(_) => "channel",
            Error::ConfigError(_) => "config",
            Error::TaskFailed(_) => "task",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
