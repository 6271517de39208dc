//! MCP session logic on top of a `Connection`.
//!
//! The engine owns the handshake, connect-with-retry (exponential backoff),
//! reconnect-before-use for stale connections, and the single-retry
//! "safe call" used by the dispatcher. Every exchange feeds the shared
//! `MetricsRegistry`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use super::config::ClientSettings;
use super::connection::{Connection, StalePolicy};
use super::errors::McpError;
use super::metrics::MetricsRegistry;
use super::types::{
    error_codes, ClientInfo, InitializeParams, InitializeResult, JsonRpcResponse, McpCall,
    McpResource, McpToolDefinition, ResourcesListResult, ToolsListResult,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Attempts made by `call_safe`: the original call plus one after reconnecting.
const CALL_ATTEMPTS: u32 = 2;

// ─── Retry Policy ────────────────────────────────────────────────────────────

/// Connection attempts and exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Sleep after the failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct ProtocolEngine {
    client_info: ClientInfo,
    protocol_version: String,
    handshake_timeout: Duration,
    retry: RetryPolicy,
    stale: StalePolicy,
    metrics: Arc<MetricsRegistry>,
}

impl ProtocolEngine {
    pub fn new(settings: &ClientSettings, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            client_info: settings.client_info(),
            protocol_version: settings.protocol_version.clone(),
            handshake_timeout: settings.handshake_timeout(),
            retry: RetryPolicy {
                max_attempts: settings.connect_attempts,
                base_delay: settings.retry_base_delay(),
            },
            stale: StalePolicy {
                max_idle: settings.stale_after(),
                max_error_rate: settings.max_error_rate,
            },
            metrics,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn stale_policy(&self) -> StalePolicy {
        self.stale
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Run the `initialize` exchange on an opened connection, then send
    /// `notifications/initialized` and mark the connection connected.
    pub async fn initialize_handshake(
        &self,
        conn: &mut Connection,
    ) -> Result<InitializeResult, McpError> {
        let server = conn.server_name().to_string();
        let params = InitializeParams::new(&self.protocol_version, self.client_info.clone());
        let params = serde_json::to_value(&params).map_err(|e| McpError::HandshakeFailed {
            server: server.clone(),
            reason: format!("failed to serialize initialize params: {e}"),
        })?;

        let exchange = async {
            let (id, sent) = conn.send_request("initialize", Some(params)).await?;
            let (response, received) = conn.read_response(id).await?;
            Ok::<_, McpError>((response, sent, received))
        };

        let outcome = match tokio::time::timeout(self.handshake_timeout, exchange).await {
            Ok(Ok((response, sent, received))) => {
                self.metrics
                    .record_bytes(&server, sent as u64, received as u64);
                extract_result(response).and_then(|value| {
                    serde_json::from_value::<InitializeResult>(value).map_err(|e| {
                        McpError::HandshakeFailed {
                            server: server.clone(),
                            reason: format!("malformed initialize result: {e}"),
                        }
                    })
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::Timeout {
                server: server.clone(),
                timeout_ms: self.handshake_timeout.as_millis() as u64,
            }),
        };

        let init = match outcome {
            Ok(init) => init,
            Err(e) => return Err(self.handshake_failed(conn, e).await),
        };

        match conn
            .send_notification("notifications/initialized", None)
            .await
        {
            Ok(sent) => self.metrics.record_bytes(&server, sent as u64, 0),
            Err(e) => return Err(self.handshake_failed(conn, e).await),
        }

        conn.mark_connected();
        tracing::info!(
            server = %server,
            conn = %conn.id(),
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            peer = init
                .server_info
                .as_ref()
                .and_then(|s| s.name.as_deref())
                .unwrap_or("unknown"),
            "handshake complete"
        );
        Ok(init)
    }

    async fn handshake_failed(&self, conn: &mut Connection, cause: McpError) -> McpError {
        conn.mark_error();
        let server = conn.server_name().to_string();

        let stderr = conn.settled_stderr_tail().await;
        if !stderr.is_empty() {
            tracing::warn!(server = %server, stderr = %stderr, "server stderr captured on failure");
        }

        let reason = match cause {
            McpError::HandshakeFailed { reason, .. } => reason,
            McpError::Timeout { timeout_ms, .. } => {
                format!("initialization timed out after {timeout_ms}ms")
            }
            other => other.to_string(),
        };
        McpError::HandshakeFailed {
            server,
            reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
        }
    }

    /// Open and handshake, retrying with exponential backoff. No sleep
    /// follows the final attempt. Leaves the connection in `error` state
    /// when every attempt fails.
    pub async fn connect_with_retry(&self, conn: &mut Connection) -> Result<(), McpError> {
        let server = conn.server_name().to_string();
        let reconnecting = conn.handshakes() > 0;
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error: Option<McpError> = None;

        for attempt in 0..attempts {
            let outcome = match conn.open().await {
                Ok(()) => self.initialize_handshake(conn).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    if reconnecting {
                        self.metrics.record_reconnection(&server);
                    }
                    if attempt > 0 {
                        tracing::info!(server = %server, attempt = attempt + 1, "connected after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        server = %server,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    self.metrics.record_error(&server, e.kind());
                    conn.disconnect().await;
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        conn.mark_error();
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        tracing::error!(server = %server, attempts, "giving up on server");
        Err(McpError::RetryExhausted {
            server,
            attempts,
            reason,
        })
    }

    /// Reconnect when the connection is closed, errored or stale.
    pub async fn ensure_ready(&self, conn: &mut Connection) -> Result<(), McpError> {
        if conn.is_connected() {
            if !conn.is_stale(&self.stale) {
                return Ok(());
            }
            tracing::debug!(server = %conn.server_name(), stats = %conn.stats_line(), "stale connection, reconnecting");
        }
        self.connect_with_retry(conn).await
    }

    /// Issue one call on a connected connection. No reconnect, no retry.
    pub async fn call(&self, conn: &mut Connection, call: &McpCall) -> Result<serde_json::Value, McpError> {
        self.call_observed(conn, call, &|| {}).await
    }

    async fn call_observed(
        &self,
        conn: &mut Connection,
        call: &McpCall,
        on_sent: &(dyn Fn() + Send + Sync),
    ) -> Result<serde_json::Value, McpError> {
        let server = conn.server_name().to_string();
        let started = Instant::now();
        let outcome = self.exchange(conn, &server, call, on_sent).await;
        let latency_us = started.elapsed().as_micros() as u64;

        match &outcome {
            Ok(_) => self.metrics.record_call(&server, latency_us, true),
            Err(e) => {
                self.metrics.record_call(&server, latency_us, false);
                self.metrics.record_error(&server, e.kind());
            }
        }
        outcome
    }

    async fn exchange(
        &self,
        conn: &mut Connection,
        server: &str,
        call: &McpCall,
        on_sent: &(dyn Fn() + Send + Sync),
    ) -> Result<serde_json::Value, McpError> {
        let (id, sent) = conn.send_request(call.method(), call.params()).await?;
        self.metrics.record_bytes(server, sent as u64, 0);
        on_sent();

        let (response, received) = conn.read_response(id).await?;
        self.metrics.record_bytes(server, 0, received as u64);
        extract_result(response)
    }

    /// Ensure the connection is ready, then call. A connection-level failure
    /// during the call triggers one reconnect and one more attempt;
    /// application errors are returned as-is.
    pub async fn call_safe(
        &self,
        conn: &mut Connection,
        call: &McpCall,
    ) -> Result<serde_json::Value, McpError> {
        self.call_safe_observed(conn, call, &|| {}).await
    }

    /// `call_safe` that invokes `on_sent` each time the request hits the wire.
    pub(crate) async fn call_safe_observed(
        &self,
        conn: &mut Connection,
        call: &McpCall,
        on_sent: &(dyn Fn() + Send + Sync),
    ) -> Result<serde_json::Value, McpError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.ensure_ready(conn).await?;

            match self.call_observed(conn, call, on_sent).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < CALL_ATTEMPTS => {
                    tracing::warn!(
                        server = %conn.server_name(),
                        call = call.label(),
                        error = %e,
                        "call failed, reconnecting"
                    );
                    conn.disconnect().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn call_tool_safe(
        &self,
        conn: &mut Connection,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.call_safe(conn, &McpCall::tool(name, arguments)).await
    }

    pub async fn list_tools(&self, conn: &mut Connection) -> Result<Vec<McpToolDefinition>, McpError> {
        let value = self.call_safe(conn, &McpCall::ListTools).await?;
        let list: ToolsListResult = decode_result(conn.server_name(), "tools/list", value)?;
        Ok(list.tools)
    }

    pub async fn list_resources(&self, conn: &mut Connection) -> Result<Vec<McpResource>, McpError> {
        let value = self.call_safe(conn, &McpCall::ListResources).await?;
        let list: ResourcesListResult = decode_result(conn.server_name(), "resources/list", value)?;
        Ok(list.resources)
    }

    pub async fn read_resource(
        &self,
        conn: &mut Connection,
        uri: &str,
    ) -> Result<serde_json::Value, McpError> {
        self.call_safe(conn, &McpCall::ReadResource { uri: uri.to_string() })
            .await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Deserialize a method's result payload.
pub(crate) fn decode_result<T: serde::de::DeserializeOwned>(
    server: &str,
    method: &str,
    value: serde_json::Value,
) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("malformed {method} result: {e}"),
    })
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
