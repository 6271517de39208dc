//! In-process MCP server on a Unix socket, used by the unit tests.
//!
//! Speaks just enough of the protocol to exercise handshakes, tool calls,
//! listing and failure modes. Behaviour is fixed at start via `FakeBehavior`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::types::ServerConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum HandshakeMode {
    #[default]
    Accept,
    /// Answer `initialize` with a JSON-RPC error.
    Reject,
    /// Answer `initialize` with a result that is not an object.
    Malformed,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    pub handshake: HandshakeMode,
    /// Never answer `tools/call`.
    pub silent_tools: bool,
    /// Answer every `tools/call` with this JSON-RPC error.
    pub tool_error: Option<(i32, String)>,
    /// Close the connection on receipt of the first N tool calls.
    pub drop_first_tool_calls: usize,
    /// Write a garbage line, a notification and an unmatched response before each reply.
    pub noise: bool,
    /// Tool replies wait for a permit from this semaphore.
    pub gate: Option<Arc<Semaphore>>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeStats {
    pub connections: AtomicUsize,
    pub initializes: AtomicUsize,
    pub initialized_notes: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Tool names in order of receipt.
    pub call_log: Mutex<Vec<String>>,
    /// Arrival time of each `initialize`.
    pub initialize_times: Mutex<Vec<Instant>>,
}

impl FakeStats {
    pub fn calls(&self) -> Vec<String> {
        self.call_log.lock().unwrap().clone()
    }

    /// Time between consecutive `initialize` requests.
    pub fn initialize_gaps(&self) -> Vec<Duration> {
        let times = self.initialize_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

pub(crate) struct FakeServer {
    _dir: tempfile::TempDir,
    path: PathBuf,
    pub stats: Arc<FakeStats>,
    accept: JoinHandle<()>,
}

impl FakeServer {
    /// Bind a fresh socket and start accepting. Must run inside a runtime.
    pub fn start(behavior: FakeBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let stats = Arc::new(FakeStats::default());
        let behavior = Arc::new(behavior);

        let accept = tokio::spawn({
            let stats = stats.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, behavior.clone(), stats.clone()));
                }
            }
        });

        Self {
            _dir: dir,
            path,
            stats,
            accept,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self, name: &str) -> ServerConfig {
        ServerConfig::socket(name, &self.path)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Poll `check` every 10ms for up to two seconds.
pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn serve(stream: UnixStream, behavior: Arc<FakeBehavior>, stats: Arc<FakeStats>) {
    let (read, write) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(write));
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match method.as_str() {
            "initialize" => {
                stats.initializes.fetch_add(1, Ordering::SeqCst);
                stats.initialize_times.lock().unwrap().push(Instant::now());
                let reply = match behavior.handshake {
                    HandshakeMode::Accept => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "fake", "version": "0.1.0"}
                        }
                    }),
                    HandshakeMode::Reject => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32603, "message": "initialization rejected"}
                    }),
                    HandshakeMode::Malformed => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": "not an object"
                    }),
                };
                reply_to(&writer, &behavior, reply).await;
            }
            "notifications/initialized" => {
                stats.initialized_notes.fetch_add(1, Ordering::SeqCst);
            }
            "tools/call" => {
                let seen = stats.tool_calls.fetch_add(1, Ordering::SeqCst);
                let name = message["params"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                stats.call_log.lock().unwrap().push(name.clone());

                if seen < behavior.drop_first_tool_calls {
                    return;
                }
                if behavior.silent_tools {
                    continue;
                }

                let reply = match &behavior.tool_error {
                    Some((code, text)) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": code, "message": text}
                    }),
                    None => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [{"type": "text", "text": format!("{name} ok")}],
                            "isError": false
                        }
                    }),
                };

                let writer = writer.clone();
                let behavior = behavior.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
                    if let Some(gate) = &behavior.gate {
                        let _permit = gate.acquire().await;
                    }
                    stats.in_flight.fetch_sub(1, Ordering::SeqCst);
                    reply_to(&writer, &behavior, reply).await;
                });
            }
            "tools/list" => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [{
                        "name": "echo",
                        "description": "Echo the input back",
                        "inputSchema": {"type": "object"}
                    }]}
                });
                reply_to(&writer, &behavior, reply).await;
            }
            "resources/list" => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"resources": [{
                        "uri": "file:///tmp/notes.txt",
                        "name": "notes.txt",
                        "mimeType": "text/plain"
                    }]}
                });
                reply_to(&writer, &behavior, reply).await;
            }
            "resources/read" => {
                let uri = message["params"]["uri"].clone();
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"contents": [{"uri": uri, "text": "hello"}]}
                });
                reply_to(&writer, &behavior, reply).await;
            }
            _ if id.is_some() => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "Method not found"}
                });
                reply_to(&writer, &behavior, reply).await;
            }
            _ => {}
        }
    }
}

async fn reply_to(writer: &Writer, behavior: &FakeBehavior, reply: Value) {
    let mut out = String::new();
    if behavior.noise {
        out.push_str("server log line, not json\n");
        out.push_str(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#);
        out.push('\n');
        out.push_str(r#"{"jsonrpc":"2.0","id":999999,"result":{}}"#);
        out.push('\n');
    }
    out.push_str(&reply.to_string());
    out.push('\n');

    let mut writer = writer.lock().await;
    let _ = writer.write_all(out.as_bytes()).await;
    let _ = writer.flush().await;
}
