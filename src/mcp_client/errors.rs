//! MCP client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// No server with this name is configured.
    #[error("server not found: '{name}'")]
    ServerNotFound {
        name: String,
    },

    /// The transport channel could not be established.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectFailed {
        server: String,
        reason: String,
    },

    /// The channel opened but the `initialize` exchange did not complete.
    #[error("handshake with server '{server}' failed: {reason}")]
    HandshakeFailed {
        server: String,
        reason: String,
    },

    /// Mid-session I/O failure (broken pipe, reset, unexpected EOF, oversized frame).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No terminal outcome within the caller's window.
    #[error("request to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        timeout_ms: u64,
    },

    /// Every pool slot for the server is checked out.
    #[error("connection pool for server '{server}' is exhausted ({max_size} connections)")]
    PoolExhausted {
        server: String,
        max_size: usize,
    },

    /// The caller cancelled the request.
    #[error("request {id} was cancelled")]
    Cancelled {
        id: u64,
    },

    /// `connect_with_retry` used up its attempt budget.
    #[error("server '{server}' unreachable after {attempts} connection attempts: {reason}")]
    RetryExhausted {
        server: String,
        attempts: u32,
        reason: String,
    },

    /// Configuration error (bad config file, invalid server entry).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// The dispatcher loop has stopped and accepts no more work.
    #[error("dispatcher is shut down")]
    DispatcherClosed,
}

impl McpError {
    /// Stable short name for the error class, used as the metrics error-type key.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::ServerNotFound { .. } => "server_not_found",
            McpError::ConnectFailed { .. } => "connect_failed",
            McpError::HandshakeFailed { .. } => "handshake_failed",
            McpError::TransportError { .. } => "transport",
            McpError::ServerError { .. } => "application",
            McpError::Timeout { .. } => "timeout",
            McpError::PoolExhausted { .. } => "pool_exhausted",
            McpError::Cancelled { .. } => "cancelled",
            McpError::RetryExhausted { .. } => "retry_exhausted",
            McpError::ConfigError { .. } => "config",
            McpError::DispatcherClosed => "dispatcher_closed",
        }
    }

    /// Whether a failed call may be retried on a fresh connection.
    ///
    /// Application errors are never retried: the server understood the
    /// request, and repeating it may not be idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::ConnectFailed { .. }
                | McpError::HandshakeFailed { .. }
                | McpError::TransportError { .. }
                | McpError::RetryExhausted { .. }
        )
    }

    /// True for failures of the channel itself rather than of the request.
    pub fn is_connection_error(&self) -> bool {
        self.is_retryable()
    }

    /// Short message for display through the collaborator boundary.
    pub fn user_message(&self) -> String {
        match self {
            McpError::ServerError { message, .. } => {
                format!("server-reported error: {message}")
            }
            e if e.is_connection_error() => format!("connection error: {e}"),
            e => e.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_is_not_retryable() {
        let err = McpError::ServerError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "application");
        assert_eq!(err.user_message(), "server-reported error: Method not found");
    }

    #[test]
    fn test_transport_error_is_connection_error() {
        let err = McpError::TransportError {
            server: "fs".into(),
            reason: "broken pipe".into(),
        };
        assert!(err.is_retryable());
        assert!(err.user_message().starts_with("connection error: "));
        assert!(err.user_message().contains("broken pipe"));
    }

    #[test]
    fn test_server_not_found_message() {
        let err = McpError::ServerNotFound {
            name: "ghost".into(),
        };
        assert_eq!(err.to_string(), "server not found: 'ghost'");
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_timeout_and_cancel_are_terminal() {
        let timeout = McpError::Timeout {
            server: "fs".into(),
            timeout_ms: 50,
        };
        let cancelled = McpError::Cancelled { id: 7 };
        assert!(!timeout.is_retryable());
        assert!(!cancelled.is_retryable());
        assert_eq!(timeout.kind(), "timeout");
        assert_eq!(cancelled.to_string(), "request 7 was cancelled");
    }

    #[test]
    fn test_pool_exhausted_is_not_a_connection_failure() {
        let err = McpError::PoolExhausted {
            server: "fs".into(),
            max_size: 2,
        };
        assert_eq!(err.kind(), "pool_exhausted");
        assert!(!err.is_retryable());
        assert!(!err.is_connection_error());
        assert_eq!(
            err.to_string(),
            "connection pool for server 'fs' is exhausted (2 connections)"
        );
    }
}
