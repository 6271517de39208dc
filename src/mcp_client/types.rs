//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the server
//! configuration consumed by the transport and pool layers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is optional so that server-initiated notifications and `id: null`
/// parse errors deserialize cleanly and can be skipped by the reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Client identity sent in the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: ClientInfo,
    pub capabilities: serde_json::Value,
}

impl InitializeParams {
    /// Build the handshake payload with the capability set this client advertises.
    pub fn new(protocol_version: &str, client_info: ClientInfo) -> Self {
        Self {
            protocol_version: protocol_version.to_string(),
            client_info,
            capabilities: serde_json::json!({
                "roots": { "listChanged": false },
                "sampling": {},
                "experimental": {},
            }),
        }
    }
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Payload of a `tools/list` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// One entry of a `resources/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResource {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

/// Payload of a `resources/list` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourcesListResult {
    #[serde(default)]
    pub resources: Vec<McpResource>,
}

/// A single call that can be issued on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum McpCall {
    /// `tools/list`
    ListTools,
    /// `tools/call` with `{name, arguments}`
    CallTool {
        name: String,
        arguments: serde_json::Value,
    },
    /// `resources/list`
    ListResources,
    /// `resources/read` with `{uri}`
    ReadResource { uri: String },
}

impl McpCall {
    /// Convenience constructor for a tool invocation.
    pub fn tool(name: &str, arguments: serde_json::Value) -> Self {
        McpCall::CallTool {
            name: name.to_string(),
            arguments,
        }
    }

    /// JSON-RPC method name.
    pub fn method(&self) -> &'static str {
        match self {
            McpCall::ListTools => "tools/list",
            McpCall::CallTool { .. } => "tools/call",
            McpCall::ListResources => "resources/list",
            McpCall::ReadResource { .. } => "resources/read",
        }
    }

    /// JSON-RPC params object, if the method takes one.
    pub fn params(&self) -> Option<serde_json::Value> {
        match self {
            McpCall::ListTools | McpCall::ListResources => None,
            McpCall::CallTool { name, arguments } => Some(serde_json::json!({
                "name": name,
                "arguments": arguments,
            })),
            McpCall::ReadResource { uri } => Some(serde_json::json!({ "uri": uri })),
        }
    }

    /// Short label for logs: the tool name for tool calls, the method otherwise.
    pub fn label(&self) -> &str {
        match self {
            McpCall::CallTool { name, .. } => name,
            other => other.method(),
        }
    }
}

/// Result of a tool call execution, as handed to collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<i32>,
    pub execution_time_ms: u64,
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix domain socket of a long-lived daemon.
    Socket,
    /// Spawned child process speaking over stdin/stdout.
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Socket => write!(f, "socket"),
            TransportKind::Stdio => write!(f, "stdio"),
        }
    }
}

/// Identity and reachability of one MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique key. Filled from the map key when loaded from a config file.
    #[serde(default)]
    pub name: String,
    /// Explicit transport kind. Inferred from `socket_path` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, alias = "socketPath", skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for spawned servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Open a pooled connection eagerly at client warm-up.
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
    /// Per-server override of the pool's maximum size.
    #[serde(default, alias = "poolMaxSize", skip_serializing_if = "Option::is_none")]
    pub pool_max_size: Option<usize>,
    /// Per-server override of the pool's idle timeout, in seconds.
    #[serde(
        default,
        alias = "idleTimeoutSecs",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// A server spawned as a child process.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: Some(TransportKind::Stdio),
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// A daemon reachable over a Unix domain socket.
    pub fn socket(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            transport: Some(TransportKind::Socket),
            socket_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_pool_max_size(mut self, size: usize) -> Self {
        self.pool_max_size = Some(size);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Resolved transport kind.
    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            Some(kind) => kind,
            None if self.socket_path.is_some() => TransportKind::Socket,
            None => TransportKind::Stdio,
        }
    }

    /// Check that the entry names a reachable endpoint for its transport.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("server name is empty".into());
        }
        match self.transport_kind() {
            TransportKind::Socket if self.socket_path.is_none() => Err(format!(
                "server '{}' uses socket transport but has no socket_path",
                self.name
            )),
            TransportKind::Stdio
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) =>
            {
                Err(format!(
                    "server '{}' uses stdio transport but has no command",
                    self.name
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Top-level MCP servers configuration file.
///
/// Accepts both `{"servers": {...}}` and the `{"mcpServers": {...}}` layout
/// used by `~/.claude.json`. Unknown top-level keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: HashMap<String, ServerConfig>,
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["method"], "notifications/initialized");
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, Some(2));
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_response_with_null_id_parses() {
        let json = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, None);
    }

    #[test]
    fn test_initialize_params_shape() {
        let params = InitializeParams::new(
            "2024-11-05",
            ClientInfo {
                name: "mcp-conduit".into(),
                version: "1.0.0".into(),
            },
        );
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["protocolVersion"], "2024-11-05");
        assert_eq!(json["clientInfo"]["name"], "mcp-conduit");
        assert_eq!(json["capabilities"]["roots"]["listChanged"], false);
        assert!(json["capabilities"]["sampling"].is_object());
    }

    #[test]
    fn test_mcp_call_params() {
        let call = McpCall::tool("read_file", serde_json::json!({"path": "/tmp"}));
        assert_eq!(call.method(), "tools/call");
        assert_eq!(call.label(), "read_file");
        let params = call.params().unwrap();
        assert_eq!(params["name"], "read_file");
        assert_eq!(params["arguments"]["path"], "/tmp");

        let read = McpCall::ReadResource {
            uri: "file:///etc/hosts".into(),
        };
        assert_eq!(read.params().unwrap()["uri"], "file:///etc/hosts");
        assert!(McpCall::ListTools.params().is_none());
        assert_eq!(McpCall::ListResources.label(), "resources/list");
    }

    #[test]
    fn test_transport_kind_inferred_from_socket_path() {
        let json = r#"{"socketPath": "/tmp/mcp.sock"}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport_kind(), TransportKind::Socket);

        let json = r#"{"command": "npx", "args": ["-y", "server"]}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport_kind(), TransportKind::Stdio);
        assert_eq!(config.args, vec!["-y", "server"]);
    }

    #[test]
    fn test_validate_rejects_missing_endpoint() {
        let mut config = ServerConfig::socket("daemon", "/tmp/x.sock");
        config.socket_path = None;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::stdio("fs", "npx", &[]);
        config.command = Some("  ".into());
        assert!(config.validate().is_err());

        assert!(ServerConfig::stdio("fs", "npx", &["server"]).validate().is_ok());
    }

    #[test]
    fn test_servers_config_accepts_mcp_servers_key() {
        let json = r#"{
            "theme": "dark",
            "mcpServers": {
                "filesystem": {"command": "npx", "args": ["fs"], "poolMaxSize": 2}
            }
        }"#;
        let config: McpServersConfig = serde_json::from_str(json).unwrap();
        let fs = &config.servers["filesystem"];
        assert_eq!(fs.pool_max_size, Some(2));
        assert_eq!(fs.command.as_deref(), Some("npx"));
    }
}
