//! Client settings and server-list loading.
//!
//! The core consumes an already-parsed `Vec<ServerConfig>` plus
//! `ClientSettings`. This module is the outer convenience layer that
//! produces them:
//! - `ClientSettings` from YAML, with `${VAR}` / `${VAR:-default}` interpolation
//! - `McpServersConfig` from JSON (`servers` or the `mcpServers` key of `~/.claude.json`)

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::{ClientInfo, McpServersConfig, ServerConfig};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Tunables for the handshake, retry, pool, and dispatcher layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// MCP protocol version sent in `initialize`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// How long to wait for the `initialize` response.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Attempts made by connect-with-retry before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// First backoff delay; doubles after each failed attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Idle time after which a connection is considered stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Error rate (errors / requests) above which a connection is stale.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Ceiling on requests in flight per server.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_server: usize,
    /// Timeout for requests submitted without an explicit one.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Period of the dispatcher's idle-eviction sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_protocol_version() -> String {
    "2024-11-05".into()
}
fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").into()
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn default_handshake_timeout_secs() -> u64 {
    30
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_max_error_rate() -> f64 {
    0.5
}
fn default_pool_max_size() -> usize {
    5
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    5
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            connect_attempts: default_connect_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            stale_after_secs: default_stale_after_secs(),
            max_error_rate: default_max_error_rate(),
            pool_max_size: default_pool_max_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_concurrent_per_server: default_max_concurrent(),
            request_timeout_ms: default_request_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientSettings {
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Reject values that would make the pool or retry loop degenerate.
    pub fn validate(&self) -> Result<(), McpError> {
        let fail = |reason: &str| -> Result<(), McpError> {
            Err(McpError::ConfigError {
                reason: reason.to_string(),
            })
        };
        if self.connect_attempts == 0 {
            return fail("connect_attempts must be at least 1");
        }
        if self.pool_max_size == 0 {
            return fail("pool_max_size must be at least 1");
        }
        if self.max_concurrent_per_server == 0 {
            return fail("max_concurrent_per_server must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return fail("max_error_rate must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Where and how the tracing subscriber writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Write to a rotated file instead of stderr.
    #[serde(default)]
    pub to_file: bool,
    /// Directory for the log file. Defaults to the platform data directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Rotated generations kept next to the live log.
    #[serde(default = "default_keep_rotations")]
    pub keep_rotations: u32,
}

fn default_log_filter() -> String {
    "mcp_conduit=info,warn".into()
}
fn default_keep_rotations() -> u32 {
    3
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            to_file: false,
            directory: None,
            keep_rotations: default_keep_rotations(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load client settings from a YAML file.
///
/// Missing keys take their defaults; `${VAR}` references are expanded first.
pub fn load_settings(path: &Path) -> Result<ClientSettings, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let settings = parse_settings(&raw)?;

    tracing::info!(
        path = %path.display(),
        pool_max_size = settings.pool_max_size,
        max_concurrent = settings.max_concurrent_per_server,
        "loaded client settings"
    );

    Ok(settings)
}

/// Parse client settings from a YAML string.
pub fn parse_settings(raw: &str) -> Result<ClientSettings, McpError> {
    let interpolated = interpolate_env_vars(raw);
    // An empty document is a valid "all defaults" config.
    let settings: ClientSettings = if interpolated.trim().is_empty() {
        ClientSettings::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse settings: {e}"),
        })?
    };
    settings.validate()?;
    Ok(settings)
}

/// Default location of the servers file: `~/.claude.json`.
pub fn default_servers_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude.json"))
}

/// Load a servers configuration file (JSON).
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config: McpServersConfig =
        serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    tracing::info!(
        path = %path.display(),
        server_count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP servers config"
    );

    Ok(config)
}

impl McpServersConfig {
    /// Flatten into the validated list the core consumes, sorted by name.
    ///
    /// Each entry's `name` is taken from its map key; `~` in socket paths
    /// and working directories is expanded.
    pub fn into_server_list(self) -> Result<Vec<ServerConfig>, McpError> {
        let mut list: Vec<ServerConfig> = self
            .servers
            .into_iter()
            .map(|(name, mut config)| {
                config.name = name;
                config.socket_path = config
                    .socket_path
                    .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())));
                config.cwd = config.cwd.map(|c| expand_tilde(&c));
                config
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));

        validate_server_list(&list)?;
        Ok(list)
    }
}

/// Check every entry and reject duplicate names.
pub fn validate_server_list(servers: &[ServerConfig]) -> Result<(), McpError> {
    let mut seen = HashSet::new();
    for server in servers {
        server
            .validate()
            .map_err(|reason| McpError::ConfigError { reason })?;
        if !seen.insert(server.name.as_str()) {
            return Err(McpError::ConfigError {
                reason: format!("duplicate server name '{}'", server.name),
            });
        }
    }
    Ok(())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
