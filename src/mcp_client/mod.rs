//! MCP Client: connection core for talking to MCP servers.
//!
//! This module handles:
//! - Framed JSON-RPC 2.0 over Unix sockets and spawned-process stdio
//! - The `initialize` handshake, reconnect with exponential backoff, and
//!   stale-connection detection
//! - Per-server connection pooling with idle eviction
//! - Prioritised, concurrency-limited asynchronous dispatch with timeouts
//!   and cancellation
//! - Per-server latency, throughput and health metrics
//!
//! Collaborators use two calls: `McpClient::call_tool` and
//! `McpClient::metrics_snapshot`.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{ClientSettings, LogFormat, LoggingConfig};
pub use connection::{Connection, ConnectionState};
pub use dispatcher::{CallRequest, Dispatcher, Priority, RequestHandle, RequestOutcome, RequestState};
pub use errors::McpError;
pub use metrics::{HealthStatus, MetricsRegistry, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use protocol::{ProtocolEngine, RetryPolicy};
pub use types::{McpCall, McpServersConfig, McpToolDefinition, ServerConfig, ToolCallResult, TransportKind};
