//! One live (or previously live) channel to an MCP server.
//!
//! A `Connection` owns its `Transport` plus protocol bookkeeping:
//! - state machine `disconnected → connecting → connected → error`
//! - per-connection, strictly increasing JSON-RPC request ids
//! - activity timestamps and request / response / error counters
//!
//! Request correlation is by id: while waiting for a response, any other
//! message (late replies to abandoned requests, server notifications, log
//! lines on stdout) is skipped.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use super::errors::McpError;
use super::transport::{Transport, STDERR_SETTLE_TIMEOUT};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerConfig};

// ─── State ───────────────────────────────────────────────────────────────────

/// Protocol-level state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Request / response / error counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounters {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
}

/// When a connection should be re-established before reuse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StalePolicy {
    pub max_idle: Duration,
    pub max_error_rate: f64,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(300),
            max_error_rate: 0.5,
        }
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

pub struct Connection {
    id: Uuid,
    config: Arc<ServerConfig>,
    state: ConnectionState,
    transport: Option<Transport>,
    last_request_id: u64,
    connected_at: Option<Instant>,
    last_activity: Instant,
    counters: ConnectionCounters,
    handshakes: u32,
    /// Set while a frame is being written; still set if that write was abandoned.
    write_in_progress: bool,
}

impl Connection {
    /// A new, disconnected connection for `config`.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            state: ConnectionState::Disconnected,
            transport: None,
            last_request_id: 0,
            connected_at: None,
            last_activity: Instant::now(),
            counters: ConnectionCounters::default(),
            handshakes: 0,
            write_in_progress: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn counters(&self) -> ConnectionCounters {
        self.counters
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Number of completed handshakes over this connection's lifetime.
    pub fn handshakes(&self) -> u32 {
        self.handshakes
    }

    /// Id of the most recent request sent (0 before the first).
    pub fn last_request_id(&self) -> u64 {
        self.last_request_id
    }

    /// errors / requests sent, or 0 when nothing has been sent.
    pub fn error_rate(&self) -> f64 {
        if self.counters.requests_sent == 0 {
            return 0.0;
        }
        self.counters.errors as f64 / self.counters.requests_sent as f64
    }

    pub fn is_stale(&self, policy: &StalePolicy) -> bool {
        self.is_stale_at(Instant::now(), policy)
    }

    /// Staleness as observed at `now`: not connected, idle beyond the
    /// policy window, or an error rate above the policy ceiling.
    pub fn is_stale_at(&self, now: Instant, policy: &StalePolicy) -> bool {
        if self.state != ConnectionState::Connected {
            return true;
        }
        if now.saturating_duration_since(self.last_activity) > policy.max_idle {
            return true;
        }
        self.counters.requests_sent > 0 && self.error_rate() > policy.max_error_rate
    }

    /// Liveness probe for pooled reuse. Does not touch the protocol.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        if self.write_in_progress {
            // A torn frame is on the wire; the channel cannot be trusted.
            self.state = ConnectionState::Error;
            return false;
        }
        self.transport.as_mut().is_some_and(|t| t.is_alive())
    }

    /// Last stderr lines of a stdio server, for error messages. Gives an
    /// exiting server a bounded moment to flush them first.
    pub fn settled_stderr_tail(&self) -> impl Future<Output = String> + Send + 'static {
        let settle = self
            .transport
            .as_ref()
            .map(|t| t.settled_stderr_tail(STDERR_SETTLE_TIMEOUT));
        async move {
            match settle {
                Some(settle) => settle.await,
                None => String::new(),
            }
        }
    }

    /// One-line summary: state, uptime, idle, counters, success rate.
    pub fn stats_line(&self) -> String {
        let now = Instant::now();
        let uptime = self
            .connected_at
            .map(|at| now.saturating_duration_since(at).as_secs())
            .unwrap_or(0);
        let idle = now.saturating_duration_since(self.last_activity).as_secs();
        let success = if self.counters.requests_sent > 0 {
            (1.0 - self.error_rate()) * 100.0
        } else {
            0.0
        };
        format!(
            "State: {}, Uptime: {uptime}s, Idle: {idle}s, Requests: {}, Responses: {}, Errors: {}, Success: {success:.1}%",
            self.state,
            self.counters.requests_sent,
            self.counters.responses_received,
            self.counters.errors,
        )
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open a fresh transport. Leaves the connection `connecting` until the
    /// handshake succeeds, or `error` if the channel cannot be opened.
    pub(crate) async fn open(&mut self) -> Result<(), McpError> {
        if self.transport.is_some() || self.state == ConnectionState::Connected {
            self.disconnect().await;
        }

        self.state = ConnectionState::Connecting;
        match Transport::connect(&self.config).await {
            Ok(transport) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        let now = Instant::now();
        self.state = ConnectionState::Connected;
        self.connected_at = Some(now);
        self.last_activity = now;
        self.handshakes += 1;
    }

    pub(crate) fn mark_error(&mut self) {
        self.state = ConnectionState::Error;
    }

    /// Close the transport. Safe to call on an already-closed connection.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
            tracing::debug!(server = %self.config.name, conn = %self.id, "connection closed");
        }
        self.write_in_progress = false;
        self.state = ConnectionState::Disconnected;
    }

    // ─── Messaging ───────────────────────────────────────────────────────

    /// Send a request. Returns its id and the number of bytes written.
    pub async fn send_request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(u64, usize), McpError> {
        self.last_request_id += 1;
        let id = self.last_request_id;
        let request = JsonRpcRequest::new(id, method, params);

        let mut line = serde_json::to_string(&request).map_err(|e| McpError::TransportError {
            server: self.config.name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push('\n');

        self.counters.requests_sent += 1;
        let written = self.write_line(&line).await?;
        self.last_activity = Instant::now();

        tracing::debug!(server = %self.config.name, id, method, "request sent");
        Ok((id, written))
    }

    /// Send a notification; no response is expected.
    pub async fn send_notification(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<usize, McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let mut line =
            serde_json::to_string(&notification).map_err(|e| McpError::TransportError {
                server: self.config.name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;
        line.push('\n');

        let written = self.write_line(&line).await?;
        self.last_activity = Instant::now();
        Ok(written)
    }

    /// Wait for the response carrying `id`. Returns it with its size in bytes.
    pub async fn read_response(&mut self, id: u64) -> Result<(JsonRpcResponse, usize), McpError> {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(self.not_open());
            };

            let message = match transport.next_message().await {
                Ok(message) => message,
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            };

            let value: serde_json::Value = match serde_json::from_str(&message) {
                Ok(value) => value,
                Err(_) => {
                    tracing::debug!(server = %self.config.name, "skipping non-JSON line");
                    continue;
                }
            };

            // Server-initiated requests and notifications carry a method.
            if value.get("method").is_some() {
                continue;
            }

            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(response) if response.id == Some(id) => {
                    self.counters.responses_received += 1;
                    self.last_activity = Instant::now();
                    return Ok((response, message.len() + 1));
                }
                Ok(response) => {
                    tracing::debug!(
                        server = %self.config.name,
                        expected = id,
                        got = ?response.id,
                        "skipping unmatched response"
                    );
                }
                Err(_) => {
                    tracing::debug!(server = %self.config.name, "skipping malformed response");
                }
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<usize, McpError> {
        let Some(transport) = self.transport.as_mut() else {
            self.counters.errors += 1;
            return Err(self.not_open());
        };

        self.write_in_progress = true;
        let result = transport.send(line.as_bytes()).await;
        self.write_in_progress = false;

        if result.is_err() {
            self.fail();
        }
        result
    }

    fn fail(&mut self) {
        self.counters.errors += 1;
        self.state = ConnectionState::Error;
    }

    fn not_open(&self) -> McpError {
        McpError::TransportError {
            server: self.config.name.clone(),
            reason: "connection is not open".into(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
