//! JSON-RPC transport to the device management service
//!
//! Unary calls are JSON-RPC 2.0 requests posted to `<base>/jsonrpc`. The
//! notification stream is a long-lived `POST <base>/notifications/stream`
//! whose body is newline-delimited JSON, one stream message per line.
//! Every request carries the agent name in the `agent_name` header.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use super::{
    ConfigEvent, ConfigOperation, DeviceSession, Notification, NotificationBatch,
    NotificationStream, RouteTableSource, TelemetryResponse, TelemetryStore,
};
use crate::error::{Error, Result};

/// Metadata header naming the calling agent
pub const AGENT_NAME_HEADER: &str = "agent_name";

const JSONRPC_PATH: &str = "/jsonrpc";
const STREAM_PATH: &str = "/notifications/stream";

/// Device client speaking JSON-RPC over HTTP
pub struct JsonRpcDevice {
    http: reqwest::Client,
    base_url: String,
    agent_name: String,
    call_timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcDevice {
    /// Build a client for `base_url`.
    ///
    /// `call_timeout` bounds unary calls only; the notification stream
    /// stays open until the device ends it.
    pub fn new(
        base_url: impl Into<String>,
        agent_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(call_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_name: agent_name.into(),
            call_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(format!("{}{}", self.base_url, JSONRPC_PATH))
            .header(AGENT_NAME_HEADER, &self.agent_name)
            .timeout(self.call_timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let envelope: RpcEnvelope = response.json().await?;
        if let Some(err) = envelope.error {
            return Err(Error::DeviceRpc(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }
        let result = envelope
            .result
            .ok_or_else(|| Error::DeviceRpc(format!("{} returned no result", method)))?;
        serde_json::from_value(result)
            .map_err(|e| Error::DecodeError(format!("{} result: {}", method, e)))
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResult {
    status: String,
    #[serde(default)]
    app_id: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResult {
    status: String,
    #[serde(default)]
    stream_id: u64,
}

fn ensure_status(status: &str, what: &str) -> Result<()> {
    if status.eq_ignore_ascii_case("success") || status == "kSdkMgrSuccess" {
        Ok(())
    } else {
        Err(Error::DeviceRpc(format!("{} returned status {}", what, status)))
    }
}

#[async_trait]
impl DeviceSession for JsonRpcDevice {
    #[instrument(skip(self), fields(agent = %self.agent_name))]
    async fn register_agent(&self) -> Result<u32> {
        let result: RegisterResult = self.call("agent.register", json!({})).await?;
        ensure_status(&result.status, "agent registration")?;
        info!(
            "Agent registration status: {} AppId: {}",
            result.status, result.app_id
        );
        Ok(result.app_id)
    }

    #[instrument(skip(self), fields(agent = %self.agent_name))]
    async fn create_config_stream(&self) -> Result<u64> {
        let created: StreamResult = self
            .call("notification.register", json!({ "op": "create" }))
            .await?;
        ensure_status(&created.status, "notification stream creation")?;
        info!(
            "Notification registration status: {} stream_id {}",
            created.status, created.stream_id
        );

        let subscribed: StreamResult = self
            .call(
                "notification.register",
                json!({
                    "op": "add_subscription",
                    "stream_id": created.stream_id,
                    "subscription": "config",
                }),
            )
            .await?;
        ensure_status(&subscribed.status, "config subscription")?;
        info!(
            "Config notification registration status: {} stream_id {}",
            subscribed.status, created.stream_id
        );
        Ok(created.stream_id)
    }

    async fn open_stream(&self, stream_id: u64) -> Result<NotificationStream> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, STREAM_PATH))
            .header(AGENT_NAME_HEADER, &self.agent_name)
            .json(&json!({ "stream_id": stream_id }))
            .send()
            .await
            .map_err(|e| Error::StreamError(format!("open stream {}: {}", stream_id, e)))?
            .error_for_status()
            .map_err(|e| Error::StreamError(format!("open stream {}: {}", stream_id, e)))?;

        debug!("Notification stream {} opened", stream_id);

        let state = LineReader {
            body: response.bytes_stream().boxed(),
            buf: Vec::new(),
            finished: false,
        };
        Ok(stream::unfold(state, next_message).boxed())
    }
}

#[async_trait]
impl TelemetryStore for JsonRpcDevice {
    async fn add_or_update(&self, path: &str, json: &str) -> Result<TelemetryResponse> {
        self.call(
            "telemetry.add_or_update",
            json!({
                "state": [{
                    "key": { "js_path": path },
                    "data": { "json_content": json },
                }]
            }),
        )
        .await
    }

    async fn delete(&self, path: &str) -> Result<TelemetryResponse> {
        self.call(
            "telemetry.delete",
            json!({ "key": [{ "js_path": path }] }),
        )
        .await
    }
}

#[async_trait]
impl RouteTableSource for JsonRpcDevice {
    async fn get_route_table(&self, network_instance: &str) -> Result<Value> {
        let path = format!("/network-instance[name={}]/route-table", network_instance);
        let result: Vec<Value> = self
            .call(
                "get",
                json!({
                    "commands": [{ "path": path, "datastore": "state" }]
                }),
            )
            .await?;
        result
            .into_iter()
            .next()
            .ok_or_else(|| Error::DecodeError(format!("empty get result for {}", path)))
    }
}

struct LineReader<S> {
    body: S,
    buf: Vec<u8>,
    finished: bool,
}

async fn next_message<S, B, E>(
    mut reader: LineReader<S>,
) -> Option<(Result<NotificationBatch>, LineReader<S>)>
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    loop {
        if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = reader.buf.drain(..=pos).collect();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some((decode_stream_line(&line), reader));
        }

        if reader.finished {
            if reader.buf.iter().all(u8::is_ascii_whitespace) {
                return None;
            }
            let rest = std::mem::take(&mut reader.buf);
            return Some((decode_stream_line(&rest), reader));
        }

        match reader.body.next().await {
            Some(Ok(chunk)) => reader.buf.extend_from_slice(chunk.as_ref()),
            Some(Err(e)) => {
                reader.finished = true;
                reader.buf.clear();
                return Some((Err(Error::StreamError(e.to_string())), reader));
            }
            None => reader.finished = true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStreamMessage {
    #[serde(default)]
    notification: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct RawConfigNotification {
    op: ConfigOperation,
    key: RawConfigKey,
    #[serde(default)]
    data: Option<RawConfigData>,
}

#[derive(Debug, Deserialize)]
struct RawConfigKey {
    js_path: String,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfigData {
    json: String,
}

/// Decode one stream line into its notification items, preserving order
pub(crate) fn decode_stream_line(line: &[u8]) -> Result<NotificationBatch> {
    let message: RawStreamMessage = serde_json::from_slice(line)
        .map_err(|e| Error::DecodeError(format!("notification message: {}", e)))?;

    message
        .notification
        .into_iter()
        .map(|mut item| match item.remove("config") {
            Some(config) => {
                let raw: RawConfigNotification = serde_json::from_value(config)
                    .map_err(|e| Error::DecodeError(format!("config notification: {}", e)))?;
                Ok(Notification::Config(ConfigEvent {
                    op: raw.op,
                    path: raw.key.js_path,
                    keys: raw.key.keys,
                    payload: raw.data.map(|d| d.json),
                }))
            }
            None => {
                let kind = item
                    .keys()
                    .find(|k| k.as_str() != "sub_id")
                    .cloned()
                    .unwrap_or_else(|| "empty".to_string());
                Ok(Notification::Unhandled(kind))
            }
        })
        .collect()
}
