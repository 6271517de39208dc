pub mod mcp_client;

use std::path::{Path, PathBuf};

use mcp_client::config::{LogFormat, LoggingConfig};
use mcp_client::McpError;

pub use mcp_client::{
    CallRequest, ClientSettings, McpClient, MetricsSnapshot, Priority, ServerConfig,
    ToolCallResult,
};

/// Name of the live log file inside the log directory.
const LOG_FILE_NAME: &str = "mcp-conduit.log";

/// Return the platform-standard data directory for mcp-conduit.
///
/// - macOS: `~/Library/Application Support/mcp-conduit/`
/// - Linux: `$XDG_DATA_HOME/mcp-conduit/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-conduit/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-conduit");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-conduit")
}

/// Install the global tracing subscriber.
///
/// With `to_file` set:
/// 1. Rotates existing logs (`mcp-conduit.log` → `.1` → `.2` …, keeps `keep_rotations`).
/// 2. Opens a fresh log with a line-flushing writer for crash resilience.
///
/// Otherwise logs go to stderr. `RUST_LOG` overrides the configured filter.
/// Returns the log file path when logging to a file.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<PathBuf>, McpError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let log_path = if config.to_file {
        let log_dir = config.directory.clone().unwrap_or_else(data_dir);
        std::fs::create_dir_all(&log_dir).map_err(|e| McpError::ConfigError {
            reason: format!("failed to create log directory {}: {e}", log_dir.display()),
        })?;
        let log_path = log_dir.join(LOG_FILE_NAME);
        rotate_log_file(&log_path, config.keep_rotations);
        Some(log_path)
    } else {
        None
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match (&log_path, config.format) {
        (Some(path), LogFormat::Plain) => builder
            .with_writer(FlushingWriter::open(path)?)
            .with_ansi(false)
            .try_init(),
        (Some(path), LogFormat::Json) => builder
            .json()
            .with_writer(FlushingWriter::open(path)?)
            .with_ansi(false)
            .try_init(),
        (None, LogFormat::Plain) => builder.with_writer(std::io::stderr).try_init(),
        (None, LogFormat::Json) => builder.json().with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| McpError::ConfigError {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-conduit starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// `tracing-subscriber` buffers log output internally. Without explicit
/// flushing, log entries may sit in OS buffers and be lost on crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }

    fn open(path: &Path) -> Result<Self, McpError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to open {}: {e}", path.display()),
            })?;
        Ok(Self::new(file))
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file.lock().map_err(|e| {
            std::io::Error::other(format!("lock poisoned: {e}"))
        })?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self.file.lock().map_err(|e| {
            std::io::Error::other(format!("lock poisoned: {e}"))
        })?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mcp-conduit.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(format!("{}.1", base.display()), "one").unwrap();
        std::fs::write(format!("{}.3", base.display()), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| std::fs::read_to_string(format!("{}.{suffix}", base.display()));
        assert_eq!(read("1").unwrap(), "current");
        assert_eq!(read("2").unwrap(), "one");
        // the old .3 was dropped before shifting
        assert!(read("3").is_err());
    }

    #[test]
    fn test_flushing_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut writer = FlushingWriter::open(&path).unwrap();
        writer.write_all(b"first\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_init_tracing_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            to_file: true,
            directory: Some(dir.path().to_path_buf()),
            format: LogFormat::Json,
            ..Default::default()
        };
        let path = init_tracing(&config).unwrap().unwrap();
        assert_eq!(path, dir.path().join(LOG_FILE_NAME));
        assert!(path.exists());

        // A second subscriber cannot be installed.
        assert!(init_tracing(&LoggingConfig::default()).is_err());
    }
}
