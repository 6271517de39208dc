//! MCP Client: high-level interface for tool execution.
//!
//! Wires the metrics registry, protocol engine, connection pool and
//! dispatcher together over a fixed set of configured servers. Every call,
//! including listing, goes through the dispatcher so the per-server
//! concurrency ceiling always holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::config::{validate_server_list, ClientSettings};
use super::dispatcher::{
    CallRequest, Dispatcher, DispatcherStats, Priority, RequestHandle, RequestId, RequestOutcome,
};
use super::errors::McpError;
use super::metrics::{MetricsRegistry, MetricsSnapshot};
use super::pool::{ConnectionPool, PoolStats};
use super::protocol::{decode_result, ProtocolEngine};
use super::types::{
    McpCall, McpResource, McpServersConfig, McpToolDefinition, ResourcesListResult, ServerConfig,
    ToolCallResult, ToolsListResult,
};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client over a fixed set of servers.
pub struct McpClient {
    configs: Arc<HashMap<String, Arc<ServerConfig>>>,
    settings: ClientSettings,
    metrics: Arc<MetricsRegistry>,
    pool: ConnectionPool,
    dispatcher: Dispatcher,
}

impl McpClient {
    /// Validate the server list and start the dispatcher.
    ///
    /// No connection is opened until the first call (or `warm_up`). Must be
    /// called inside a Tokio runtime.
    pub fn new(servers: Vec<ServerConfig>, settings: ClientSettings) -> Result<Self, McpError> {
        settings.validate()?;
        validate_server_list(&servers)?;

        let configs: HashMap<String, Arc<ServerConfig>> = servers
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(config)))
            .collect();
        let configs = Arc::new(configs);

        let metrics = Arc::new(MetricsRegistry::new());
        let engine = Arc::new(ProtocolEngine::new(&settings, metrics.clone()));
        let pool = ConnectionPool::from_settings(&settings, engine);
        let dispatcher = Dispatcher::start(configs.clone(), pool.clone(), &settings);

        tracing::info!(servers = configs.len(), "MCP client ready");

        Ok(Self {
            configs,
            settings,
            metrics,
            pool,
            dispatcher,
        })
    }

    /// Create a client from a parsed servers configuration file.
    pub fn from_config(config: McpServersConfig, settings: ClientSettings) -> Result<Self, McpError> {
        Self::new(config.into_server_list()?, settings)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open a pooled connection to every `auto_start` server by listing its
    /// tools. Returns the servers that failed (partial startup is OK).
    pub async fn warm_up(&self) -> Vec<(String, McpError)> {
        let mut names: Vec<&String> = self
            .configs
            .iter()
            .filter(|(_, config)| config.auto_start)
            .map(|(name, _)| name)
            .collect();
        names.sort();

        let mut failures = Vec::new();
        let mut handles = Vec::new();
        for name in names {
            match self.dispatcher.submit(CallRequest::new(name, McpCall::ListTools)) {
                Ok(handle) => handles.push(handle),
                Err(e) => failures.push((name.clone(), e)),
            }
        }

        for outcome in Dispatcher::wait_all(handles).await {
            match outcome.result {
                Ok(_) => tracing::info!(server = %outcome.server, "server warmed up"),
                Err(e) => {
                    tracing::warn!(server = %outcome.server, error = %e, "server failed to warm up");
                    failures.push((outcome.server, e));
                }
            }
        }
        failures
    }

    /// Cancel outstanding requests, stop the dispatcher and close every
    /// pooled connection.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        let closed = self.pool.shutdown().await;
        tracing::info!(closed, "MCP client shut down");
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call and wait for it.
    ///
    /// Server-reported failures (JSON-RPC errors, or `isError` results) come
    /// back as `Ok` with `success: false`; connection failures, timeouts and
    /// cancellation are `Err`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let outcome = self
            .dispatcher
            .submit(CallRequest::tool(server, tool, arguments))?
            .wait()
            .await;
        tool_result(tool, outcome)
    }

    /// Queue a tool call without waiting for it.
    pub fn call_tool_async(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<RequestHandle, McpError> {
        let mut request = CallRequest::tool(server, tool, arguments).with_priority(priority);
        request.timeout = timeout;
        self.dispatcher.submit(request)
    }

    /// Submit a batch; see `Dispatcher::wait_all` to block on it.
    pub fn call_parallel(&self, requests: Vec<CallRequest>) -> Vec<Result<RequestHandle, McpError>> {
        self.dispatcher.call_parallel(requests)
    }

    pub async fn cancel(&self, id: RequestId) -> bool {
        self.dispatcher.cancel(id).await
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let value = self.dispatch(server, McpCall::ListTools).await?;
        let list: ToolsListResult = decode_result(server, "tools/list", value)?;
        Ok(list.tools)
    }

    pub async fn list_resources(&self, server: &str) -> Result<Vec<McpResource>, McpError> {
        let value = self.dispatch(server, McpCall::ListResources).await?;
        let list: ResourcesListResult = decode_result(server, "resources/list", value)?;
        Ok(list.resources)
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<serde_json::Value, McpError> {
        self.dispatch(
            server,
            McpCall::ReadResource {
                uri: uri.to_string(),
            },
        )
        .await
    }

    async fn dispatch(&self, server: &str, call: McpCall) -> Result<serde_json::Value, McpError> {
        self.dispatcher
            .submit(CallRequest::new(server, call))?
            .result()
            .await
    }

    // ─── Observability ───────────────────────────────────────────────────

    pub fn metrics_snapshot(&self, server: &str) -> Option<MetricsSnapshot> {
        self.metrics.snapshot(server)
    }

    pub fn reset_metrics(&self, server: &str) -> bool {
        self.metrics.reset(server)
    }

    pub fn pool_stats(&self, server: &str) -> Option<PoolStats> {
        self.pool.stats(server)
    }

    pub async fn dispatcher_stats(&self) -> Result<DispatcherStats, McpError> {
        self.dispatcher.stats().await
    }

    /// Human-readable metrics for one configured server.
    pub fn stats_report(&self, server: &str) -> Result<String, McpError> {
        if !self.is_configured(server) {
            return Err(McpError::ServerNotFound {
                name: server.to_string(),
            });
        }
        Ok(match self.metrics.snapshot(server) {
            Some(snapshot) => snapshot.to_string(),
            None => format!("Server: {server} (N/A)\n  No activity recorded"),
        })
    }

    /// Close idle connections past their timeout on every server.
    pub async fn evict_idle(&self) -> usize {
        self.pool.evict_idle(None).await
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Configured server names, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_configured(&self, server: &str) -> bool {
        self.configs.contains_key(server)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Map a dispatched tool call's outcome onto the collaborator-facing result.
fn tool_result(tool: &str, outcome: RequestOutcome) -> Result<ToolCallResult, McpError> {
    let elapsed = outcome.elapsed.as_millis() as u64;

    match outcome.result {
        Ok(result) => {
            let is_error = result
                .get("isError")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let error = is_error.then(|| {
                result["content"]
                    .as_array()
                    .and_then(|items| items.iter().find_map(|item| item["text"].as_str()))
                    .unwrap_or("tool reported an error")
                    .to_string()
            });
            Ok(ToolCallResult {
                tool_name: tool.to_string(),
                success: !is_error,
                result: Some(result),
                error,
                error_code: None,
                execution_time_ms: elapsed,
            })
        }
        Err(McpError::ServerError {
            code,
            message,
            data,
        }) => {
            let error = McpError::ServerError {
                code,
                message,
                data,
            }
            .user_message();
            Ok(ToolCallResult {
                tool_name: tool.to_string(),
                success: false,
                result: None,
                error: Some(error),
                error_code: Some(code),
                execution_time_ms: elapsed,
            })
        }
        Err(e) => Err(e),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
