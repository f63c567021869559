//! JSON publish/delete on top of a [`TelemetryStore`]

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::{TelemetryResponse, TelemetryStore};
use crate::error::{Error, Result};

/// Encodes state as JSON and writes it to telemetry paths
#[derive(Clone)]
pub struct TelemetryClient {
    store: Arc<dyn TelemetryStore>,
}

impl TelemetryClient {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Publish `state` at `path`.
    ///
    /// An encode failure is returned as [`Error::SerializationError`], which
    /// callers treat as fatal. A device-side rejection is returned as
    /// [`Error::DeviceRpc`].
    pub async fn publish<T: Serialize + ?Sized>(&self, path: &str, state: &T) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let response = self.store.add_or_update(path, &json).await?;
        debug!(
            "Telemetry add/update status: {} error_string: {} path: {}",
            response.status, response.error_str, path
        );
        check(response, "add/update", path)
    }

    /// Delete the subtree at `path`
    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.store.delete(path).await?;
        debug!(
            "Telemetry delete status: {} error_string: {} path: {}",
            response.status, response.error_str, path
        );
        check(response, "delete", path)
    }
}

fn check(response: TelemetryResponse, op: &str, path: &str) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    warn!(
        "Telemetry {} rejected for {}: {} {}",
        op, path, response.status, response.error_str
    );
    Err(Error::DeviceRpc(format!(
        "telemetry {} of {} returned {}: {}",
        op, path, response.status, response.error_str
    )))
}
