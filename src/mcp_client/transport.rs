//! Byte-channel transport to an MCP server.
//!
//! Two mechanisms share one send / receive / disconnect contract:
//! - Unix domain socket to a long-lived daemon
//! - Spawned child process, using its stdin/stdout as the channel
//!
//! Messages are newline-delimited JSON. The transport only frames bytes;
//! it never retries. Retry policy belongs to the protocol engine.

use std::collections::VecDeque;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;

use super::errors::McpError;
use super::types::{ServerConfig, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Largest message accepted from a server before the channel is failed.
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Size of `sockaddr_un.sun_path`, including the trailing NUL.
#[cfg(target_os = "linux")]
const SUN_PATH_MAX: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_MAX: usize = 104;

const READ_CHUNK_SIZE: usize = 8192;

/// Grace period for a child to exit after its stdin is closed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of trailing stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Longest wait for a failed child's stderr to reach EOF before reporting.
pub const STDERR_SETTLE_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Outcome of one receive step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One complete newline-delimited message, without the delimiter.
    Message(String),
    /// Bytes were read but no full frame is buffered yet.
    Incomplete,
    /// The peer closed the channel.
    Closed,
}

/// Accumulates raw bytes and splits them into newline-delimited frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame. Blank lines are skipped.
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|&b| b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    /// Bytes buffered that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ─── Stderr capture ──────────────────────────────────────────────────────────

/// Trailing stderr lines of a child, shared with the task draining them.
#[derive(Default)]
struct StderrTail {
    lines: Mutex<VecDeque<String>>,
    /// Set once the drain task has seen EOF.
    closed: AtomicBool,
    done: Notify,
}

impl StderrTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    fn joined(&self) -> String {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join(" | "))
            .unwrap_or_default()
    }

    /// Wait up to `wait` for the drain task to reach EOF.
    async fn settle(&self, wait: Duration) {
        // Registered before the flag check so a concurrent `finish` is not missed.
        let done = self.done.notified();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(wait, done).await;
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

enum Channel {
    Socket {
        stream: UnixStream,
        path: PathBuf,
    },
    Stdio {
        child: Child,
        stdin: Option<ChildStdin>,
        stdout: ChildStdout,
        stderr: Arc<StderrTail>,
    },
    Closed,
}

/// A framed, bi-directional channel to one MCP server.
pub struct Transport {
    server: String,
    kind: TransportKind,
    channel: Channel,
    frames: FrameBuffer,
}

impl Transport {
    /// Open a channel as described by `config`.
    pub async fn connect(config: &ServerConfig) -> Result<Self, McpError> {
        let kind = config.transport_kind();
        let channel = match kind {
            TransportKind::Socket => connect_socket(config).await?,
            TransportKind::Stdio => spawn_stdio(config)?,
        };

        tracing::debug!(server = %config.name, transport = %kind, "transport opened");

        Ok(Self {
            server: config.name.clone(),
            kind,
            channel,
            frames: FrameBuffer::new(),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.channel, Channel::Closed)
    }

    /// Write `bytes` fully. Broken pipe and reset are fatal for the channel.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize, McpError> {
        let result = match &mut self.channel {
            Channel::Socket { stream, .. } => write_all_flush(stream, bytes).await,
            Channel::Stdio {
                stdin: Some(stdin), ..
            } => write_all_flush(stdin, bytes).await,
            Channel::Stdio { stdin: None, .. } | Channel::Closed => {
                return Err(self.closed_error());
            }
        };

        result
            .map(|()| bytes.len())
            .map_err(|e| self.io_error("write", e))
    }

    /// Perform one receive step.
    ///
    /// Returns a buffered frame immediately if one is complete; otherwise
    /// waits for one read from the channel and reports what it produced.
    pub async fn receive_frame(&mut self) -> Result<Frame, McpError> {
        if let Some(message) = self.take_frame()? {
            return Ok(Frame::Message(message));
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = match &mut self.channel {
            Channel::Socket { stream, .. } => stream.read(&mut chunk).await,
            Channel::Stdio { stdout, .. } => stdout.read(&mut chunk).await,
            Channel::Closed => return Ok(Frame::Closed),
        };
        let n = read.map_err(|e| self.io_error("read", e))?;

        if n == 0 {
            return Ok(Frame::Closed);
        }

        self.frames.extend(&chunk[..n]);
        if let Some(message) = self.take_frame()? {
            return Ok(Frame::Message(message));
        }

        if self.frames.pending() > MAX_MESSAGE_SIZE {
            return Err(self.oversized());
        }

        Ok(Frame::Incomplete)
    }

    /// Pop a complete frame, failing the buffer if it is over the size limit.
    fn take_frame(&mut self) -> Result<Option<String>, McpError> {
        match self.frames.next_frame() {
            Some(message) if message.len() > MAX_MESSAGE_SIZE => Err(self.oversized()),
            other => Ok(other),
        }
    }

    fn oversized(&mut self) -> McpError {
        self.frames.clear();
        McpError::TransportError {
            server: self.server.clone(),
            reason: format!("incoming message exceeds {MAX_MESSAGE_SIZE} bytes"),
        }
    }

    /// Wait for the next complete message. EOF is a transport error here.
    pub async fn next_message(&mut self) -> Result<String, McpError> {
        loop {
            match self.receive_frame().await? {
                Frame::Message(message) => return Ok(message),
                Frame::Incomplete => continue,
                Frame::Closed => {
                    return Err(McpError::TransportError {
                        server: self.server.clone(),
                        reason: "channel closed by peer (EOF)".into(),
                    });
                }
            }
        }
    }

    /// Cheap liveness probe used before reusing an idle channel.
    ///
    /// Socket: no pending `SO_ERROR` and a non-blocking read does not report
    /// EOF. Bytes found by the probe are kept in the frame buffer.
    /// Stdio: the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.channel {
            Channel::Socket { stream, .. } => {
                if !matches!(stream.take_error(), Ok(None)) {
                    return false;
                }
                let mut probe = [0u8; READ_CHUNK_SIZE];
                match stream.try_read(&mut probe) {
                    Ok(0) => false,
                    Ok(n) => {
                        self.frames.extend(&probe[..n]);
                        true
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
            Channel::Stdio { child, .. } => matches!(child.try_wait(), Ok(None)),
            Channel::Closed => false,
        }
    }

    /// Last lines the server wrote to stderr (stdio transport only).
    pub fn stderr_tail(&self) -> String {
        match &self.channel {
            Channel::Stdio { stderr, .. } => stderr.joined(),
            _ => String::new(),
        }
    }

    /// Like [`stderr_tail`](Self::stderr_tail), but first gives a dying child
    /// up to `wait` for its stderr to be fully drained.
    ///
    /// The returned future owns its state and does not borrow the transport.
    pub fn settled_stderr_tail(&self, wait: Duration) -> impl Future<Output = String> + Send + 'static {
        let stderr = match &self.channel {
            Channel::Stdio { stderr, .. } => Some(stderr.clone()),
            _ => None,
        };
        async move {
            match stderr {
                Some(stderr) => {
                    stderr.settle(wait).await;
                    stderr.joined()
                }
                None => String::new(),
            }
        }
    }

    /// Close the channel and release buffers. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        let channel = std::mem::replace(&mut self.channel, Channel::Closed);
        self.frames.clear();

        match channel {
            Channel::Socket { mut stream, path } => {
                let _ = stream.shutdown().await;
                tracing::debug!(server = %self.server, path = %path.display(), "socket closed");
            }
            Channel::Stdio {
                mut child, stdin, ..
            } => {
                // EOF on stdin asks a well-behaved server to exit on its own.
                drop(stdin);
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(server = %self.server, %status, "server process exited");
                    }
                    _ => {
                        tracing::warn!(server = %self.server, "server did not exit, killing");
                        let _ = child.kill().await;
                    }
                }
            }
            Channel::Closed => {}
        }
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server.clone(),
            reason: "channel is closed".into(),
        }
    }

    fn io_error(&self, op: &str, e: std::io::Error) -> McpError {
        let reason = match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                format!("peer closed the channel during {op}: {e}")
            }
            _ => format!("{op} failed: {e}"),
        };
        McpError::TransportError {
            server: self.server.clone(),
            reason,
        }
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

// ─── Connecting ──────────────────────────────────────────────────────────────

async fn connect_socket(config: &ServerConfig) -> Result<Channel, McpError> {
    let fail = |reason: String| McpError::ConnectFailed {
        server: config.name.clone(),
        reason,
    };

    let path = config
        .socket_path
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| fail("socket path is empty".into()))?;

    let len = path.as_os_str().len();
    if len >= SUN_PATH_MAX {
        return Err(fail(format!(
            "socket path is too long ({len} bytes, limit {})",
            SUN_PATH_MAX - 1
        )));
    }

    if !path.exists() {
        return Err(fail(format!("socket path does not exist: {}", path.display())));
    }

    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| fail(format!("{}: {e}", path.display())))?;

    Ok(Channel::Socket {
        stream,
        path: path.to_path_buf(),
    })
}

fn spawn_stdio(config: &ServerConfig) -> Result<Channel, McpError> {
    let fail = |reason: String| McpError::ConnectFailed {
        server: config.name.clone(),
        reason,
    };

    let command = config
        .command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| fail("no command configured".into()))?;

    let mut cmd = Command::new(command);
    cmd.args(&config.args);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| fail(format!("failed to spawn '{command}': {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| fail("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| fail("failed to capture stdout".into()))?;

    let tail = Arc::new(StderrTail::default());
    match child.stderr.take() {
        Some(stderr) => {
            tokio::spawn(drain_stderr(config.name.clone(), stderr, tail.clone()));
        }
        None => tail.finish(),
    }

    tracing::debug!(server = %config.name, command, pid = ?child.id(), "spawned server process");

    Ok(Channel::Stdio {
        child,
        stdin: Some(stdin),
        stdout,
        stderr: tail,
    })
}

/// Forward a child's stderr into the log, keeping the last few lines.
async fn drain_stderr(server: String, stderr: ChildStderr, tail: Arc<StderrTail>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "server stderr");
        tail.push(line);
    }
    tail.finish();
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_frame_buffer_splits_lines() {
        let mut frames = FrameBuffer::new();
        frames.extend(b"{\"a\":1}\n{\"b\":");
        assert_eq!(frames.next_frame().as_deref(), Some("{\"a\":1}"));
        assert_eq!(frames.next_frame(), None);
        assert_eq!(frames.pending(), 5);

        frames.extend(b"2}\r\n\n\n{\"c\":3}\n");
        assert_eq!(frames.next_frame().as_deref(), Some("{\"b\":2}"));
        assert_eq!(frames.next_frame().as_deref(), Some("{\"c\":3}"));
        assert_eq!(frames.next_frame(), None);
        assert_eq!(frames.pending(), 0);
    }

    #[tokio::test]
    async fn test_connect_socket_empty_path() {
        let config = ServerConfig::socket("daemon", "");
        let err = Transport::connect(&config).await.err().unwrap();
        assert!(matches!(err, McpError::ConnectFailed { .. }));
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_connect_socket_path_too_long() {
        let long = format!("/tmp/{}.sock", "x".repeat(200));
        let config = ServerConfig::socket("daemon", long);
        let err = Transport::connect(&config).await.err().unwrap();
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn test_connect_socket_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::socket("daemon", dir.path().join("absent.sock"));
        let err = Transport::connect(&config).await.err().unwrap();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_socket_round_trip_with_split_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "ping");
            write.write_all(b"po").await.unwrap();
            write.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write.write_all(b"ng\nsecond\n").await.unwrap();
        });

        let mut transport = Transport::connect(&ServerConfig::socket("srv", &path))
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportKind::Socket);
        assert_eq!(transport.send(b"ping\n").await.unwrap(), 5);
        assert_eq!(transport.next_message().await.unwrap(), "pong");
        assert_eq!(transport.next_message().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_socket_peer_close_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut transport = Transport::connect(&ServerConfig::socket("srv", &path))
            .await
            .unwrap();
        assert_eq!(transport.receive_frame().await.unwrap(), Frame::Closed);

        let err = transport.next_message().await.unwrap_err();
        assert!(err.to_string().contains("EOF"));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let blob = vec![b'x'; MAX_MESSAGE_SIZE + 4096];
            let _ = stream.write_all(&blob).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut transport = Transport::connect(&ServerConfig::socket("srv", &path))
            .await
            .unwrap();
        let err = transport.next_message().await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_oversized_line_in_one_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut blob = vec![b'x'; MAX_MESSAGE_SIZE + 4464];
            blob.push(b'\n');
            blob.extend_from_slice(b"{\"ok\":true}\n");
            let _ = stream.write_all(&blob).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut transport = Transport::connect(&ServerConfig::socket("srv", &path))
            .await
            .unwrap();
        let err = transport.next_message().await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_complete_frame_over_limit_is_rejected() {
        let mut transport = Transport {
            server: "srv".into(),
            kind: TransportKind::Socket,
            channel: Channel::Closed,
            frames: FrameBuffer::new(),
        };
        let mut line = vec![b'y'; MAX_MESSAGE_SIZE + 1];
        line.push(b'\n');
        transport.frames.extend(&line);
        transport.frames.extend(b"{\"next\":1}\n");

        assert!(transport.take_frame().is_err());
        // the whole buffer is discarded with the oversized frame
        assert_eq!(transport.frames.pending(), 0);

        transport.frames.extend(b"{\"fits\":1}\n");
        assert_eq!(transport.take_frame().unwrap().as_deref(), Some("{\"fits\":1}"));
    }

    #[tokio::test]
    async fn test_settled_stderr_tail_waits_for_exit_output() {
        let config = ServerConfig::stdio(
            "noisy",
            "sh",
            &["-c", "sleep 0.1; echo 'first' >&2; echo 'fatal: missing API key' >&2; exit 1"],
        );
        let transport = Transport::connect(&config).await.unwrap();
        // nothing written yet
        assert_eq!(transport.stderr_tail(), "");

        let tail = transport.settled_stderr_tail(STDERR_SETTLE_TIMEOUT).await;
        assert_eq!(tail, "first | fatal: missing API key");
    }

    #[tokio::test]
    async fn test_settled_stderr_tail_is_bounded_for_live_child() {
        let config = ServerConfig::stdio("quiet", "cat", &[]);
        let mut transport = Transport::connect(&config).await.unwrap();

        let started = std::time::Instant::now();
        let tail = transport.settled_stderr_tail(Duration::from_millis(50)).await;
        assert_eq!(tail, "");
        assert!(started.elapsed() < Duration::from_secs(1));
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_stdio_echo_and_disconnect() {
        let config = ServerConfig::stdio("echo", "cat", &[]);
        let mut transport = Transport::connect(&config).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::Stdio);
        assert!(transport.is_alive());

        transport.send(b"{\"hello\":true}\n").await.unwrap();
        assert_eq!(transport.next_message().await.unwrap(), "{\"hello\":true}");

        transport.disconnect().await;
        assert!(transport.is_closed());
        assert!(!transport.is_alive());
        // idempotent
        transport.disconnect().await;
        assert!(transport.send(b"late\n").await.is_err());
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure() {
        let config = ServerConfig::stdio("ghost", "/nonexistent/mcp-server-binary", &[]);
        let err = Transport::connect(&config).await.err().unwrap();
        assert!(matches!(err, McpError::ConnectFailed { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }
}
