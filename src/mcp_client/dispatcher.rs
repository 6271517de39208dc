//! Asynchronous request dispatcher.
//!
//! Callers submit `CallRequest`s and get a `RequestHandle` back immediately.
//! One Tokio task owns all dispatch state and runs a `select!` loop over:
//! - commands from `Dispatcher` handles (submit, cancel, find, stats, shutdown)
//! - in-flight calls, each a pool checkout plus a safe call, bounded by a
//!   timeout and abortable for cancellation
//! - progress events (connection acquired, request sent)
//! - the idle-sweep interval
//!
//! Queues are strict-priority FIFOs (urgent, high, normal, low). A request is
//! dispatched when its server has fewer in-flight requests than its ceiling,
//! `min(max_concurrent_per_server, pool max size)`. A server at its ceiling
//! does not hold back other servers' requests. Lower priorities can starve
//! under sustained urgent load.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{abortable, join_all, AbortHandle, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::config::ClientSettings;
use super::errors::McpError;
use super::pool::ConnectionPool;
use super::types::{McpCall, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a server stays skipped after the pool reported no free slot.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(50);

// ─── Requests ────────────────────────────────────────────────────────────────

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// Dequeue order.
    const DESCENDING: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Queued,
    /// Connection checked out, request being written.
    Sending,
    /// Request written, awaiting the response.
    Waiting,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Failed
                | RequestState::Timeout
                | RequestState::Cancelled
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Queued => "queued",
            RequestState::Sending => "sending",
            RequestState::Waiting => "waiting",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Timeout => "timeout",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A call to submit to the dispatcher.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub server: String,
    pub call: McpCall,
    pub priority: Priority,
    /// Response window, measured from first dispatch. Defaults to the client setting.
    pub timeout: Option<Duration>,
}

impl CallRequest {
    pub fn new(server: &str, call: McpCall) -> Self {
        Self {
            server: server.to_string(),
            call,
            priority: Priority::default(),
            timeout: None,
        }
    }

    pub fn tool(server: &str, tool: &str, arguments: serde_json::Value) -> Self {
        Self::new(server, McpCall::tool(tool, arguments))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Invoked once on the dispatch loop when a request reaches a terminal state.
/// Must not block.
pub type CompletionCallback = Box<dyn FnOnce(&RequestOutcome) + Send + 'static>;

/// Terminal outcome of a request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub id: RequestId,
    pub server: String,
    pub label: String,
    pub priority: Priority,
    pub state: RequestState,
    pub result: Result<serde_json::Value, McpError>,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Live view of a request that has not yet reached a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub id: RequestId,
    pub server: String,
    pub label: String,
    pub priority: Priority,
    pub state: RequestState,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Caller's side of a submitted request.
pub struct RequestHandle {
    id: RequestId,
    server: String,
    label: String,
    priority: Priority,
    queued_at: DateTime<Utc>,
    submitted: Instant,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> RequestOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => RequestOutcome {
                id: self.id,
                server: self.server,
                label: self.label,
                priority: self.priority,
                state: RequestState::Failed,
                result: Err(McpError::DispatcherClosed),
                queued_at: self.queued_at,
                sent_at: None,
                completed_at: Utc::now(),
                elapsed: self.submitted.elapsed(),
            },
        }
    }

    /// Wait for the outcome and keep only its result.
    pub async fn result(self) -> Result<serde_json::Value, McpError> {
        self.wait().await.result
    }
}

/// Load of one server at stats time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerLoad {
    pub server: String,
    pub queued: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    /// Servers with queued or in-flight work, sorted by name.
    pub servers: Vec<ServerLoad>,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

enum Command {
    Submit {
        id: RequestId,
        request: CallRequest,
        config: Arc<ServerConfig>,
        queued_at: DateTime<Utc>,
        reply: oneshot::Sender<RequestOutcome>,
        callback: Option<CompletionCallback>,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Find {
        id: RequestId,
        reply: oneshot::Sender<Option<RequestInfo>>,
    },
    Stats {
        reply: oneshot::Sender<DispatcherStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the dispatch loop.
#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    configs: Arc<HashMap<String, Arc<ServerConfig>>>,
}

impl Dispatcher {
    /// Spawn the dispatch loop. Must be called inside a Tokio runtime.
    pub fn start(
        configs: Arc<HashMap<String, Arc<ServerConfig>>>,
        pool: ConnectionPool,
        settings: &ClientSettings,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(DispatchLoop::new(pool, settings).run(rx));

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            configs,
        }
    }

    /// Queue a request. Fails immediately for an unknown server or a
    /// stopped dispatcher.
    pub fn submit(&self, request: CallRequest) -> Result<RequestHandle, McpError> {
        self.enqueue(request, None)
    }

    /// Queue a request whose outcome is also handed to `callback`.
    pub fn submit_with_callback(
        &self,
        request: CallRequest,
        callback: impl FnOnce(&RequestOutcome) + Send + 'static,
    ) -> Result<RequestHandle, McpError> {
        self.enqueue(request, Some(Box::new(callback)))
    }

    /// Submit a batch. Each entry fails or succeeds independently.
    pub fn call_parallel(
        &self,
        requests: Vec<CallRequest>,
    ) -> Vec<Result<RequestHandle, McpError>> {
        requests.into_iter().map(|r| self.submit(r)).collect()
    }

    /// Wait until every handle in the batch is terminal. Outcomes keep the
    /// order of `handles`.
    pub async fn wait_all(handles: Vec<RequestHandle>) -> Vec<RequestOutcome> {
        join_all(handles.into_iter().map(RequestHandle::wait)).await
    }

    fn enqueue(
        &self,
        request: CallRequest,
        callback: Option<CompletionCallback>,
    ) -> Result<RequestHandle, McpError> {
        let config = self
            .configs
            .get(&request.server)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound {
                name: request.server.clone(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queued_at = Utc::now();
        let (reply, rx) = oneshot::channel();
        let handle = RequestHandle {
            id,
            server: request.server.clone(),
            label: request.call.label().to_string(),
            priority: request.priority,
            queued_at,
            submitted: Instant::now(),
            rx,
        };

        self.commands
            .send(Command::Submit {
                id,
                request,
                config,
                queued_at,
                reply,
                callback,
            })
            .map_err(|_| McpError::DispatcherClosed)?;
        Ok(handle)
    }

    /// Cancel a queued or in-flight request. False if it is unknown or
    /// already terminal.
    pub async fn cancel(&self, id: RequestId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Live state of a non-terminal request.
    pub async fn find_request(&self, id: RequestId) -> Option<RequestInfo> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Find { id, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn stats(&self) -> Result<DispatcherStats, McpError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| McpError::DispatcherClosed)?;
        rx.await.map_err(|_| McpError::DispatcherClosed)
    }

    /// Cancel everything outstanding and stop the loop.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn is_configured(&self, server: &str) -> bool {
        self.configs.contains_key(server)
    }
}

// ─── Dispatch Loop ───────────────────────────────────────────────────────────

struct Tracked {
    request: CallRequest,
    config: Arc<ServerConfig>,
    state: RequestState,
    queued_at: DateTime<Utc>,
    submitted: Instant,
    sent_at: Option<DateTime<Utc>>,
    /// End of the response window, fixed at first dispatch.
    deadline: Option<Instant>,
    reply: Option<oneshot::Sender<RequestOutcome>>,
    callback: Option<CompletionCallback>,
}

impl Tracked {
    fn info(&self, id: RequestId) -> RequestInfo {
        RequestInfo {
            id,
            server: self.config.name.clone(),
            label: self.request.call.label().to_string(),
            priority: self.request.priority,
            state: self.state,
            queued_at: self.queued_at,
            sent_at: self.sent_at,
        }
    }
}

enum Step {
    Finished(Result<serde_json::Value, McpError>),
    /// The pool had no free slot. Always `McpError::PoolExhausted`.
    Exhausted(McpError),
    TimedOut,
}

enum Progress {
    Acquired,
    Sent,
}

/// In-flight work reporting back. Both completion variants carry the server
/// so its slot is freed only once the future, and its connection, is gone.
enum LoopEvent {
    Done(RequestId, String, Step),
    Aborted(RequestId, String),
    Unblock(String),
}

struct DispatchLoop {
    pool: ConnectionPool,
    max_concurrent: usize,
    default_timeout: Duration,
    sweep_interval: Duration,
    queues: [VecDeque<RequestId>; 4],
    requests: HashMap<RequestId, Tracked>,
    /// In-flight count per server.
    active: HashMap<String, usize>,
    /// Servers skipped until an `Unblock` event, after pool exhaustion.
    blocked: HashSet<String>,
    in_flight: FuturesUnordered<BoxFuture<'static, LoopEvent>>,
    aborts: HashMap<RequestId, AbortHandle>,
    progress_tx: mpsc::UnboundedSender<(RequestId, Progress)>,
    progress_rx: mpsc::UnboundedReceiver<(RequestId, Progress)>,
    counters: DispatcherStats,
}

impl DispatchLoop {
    fn new(pool: ConnectionPool, settings: &ClientSettings) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            max_concurrent: settings.max_concurrent_per_server.max(1),
            default_timeout: settings.request_timeout(),
            sweep_interval: settings.sweep_interval(),
            queues: Default::default(),
            requests: HashMap::new(),
            active: HashMap::new(),
            blocked: HashSet::new(),
            in_flight: FuturesUnordered::new(),
            aborts: HashMap::new(),
            progress_tx,
            progress_rx,
            counters: DispatcherStats::default(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        tracing::debug!(max_concurrent = self.max_concurrent, "dispatcher started");

        loop {
            self.dispatch_ready();

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.cancel_all();
                        break;
                    };
                    if let Some(reply) = self.handle(command) {
                        commands.close();
                        self.cancel_all();
                        let _ = reply.send(());
                        break;
                    }
                }
                Some(event) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_event(event);
                }
                Some((id, progress)) = self.progress_rx.recv() => self.on_progress(id, progress),
                _ = sweep.tick() => {
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        let evicted = pool.evict_idle(None).await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "idle sweep");
                        }
                    });
                }
            }
        }

        tracing::debug!("dispatcher stopped");
    }

    /// Apply one command. Returns the reply channel when it asks for shutdown.
    fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Submit {
                id,
                request,
                config,
                queued_at,
                reply,
                callback,
            } => {
                tracing::debug!(
                    id,
                    server = %config.name,
                    call = request.call.label(),
                    priority = ?request.priority,
                    "request queued"
                );
                self.queues[request.priority.index()].push_back(id);
                self.requests.insert(
                    id,
                    Tracked {
                        request,
                        config,
                        state: RequestState::Queued,
                        queued_at,
                        submitted: Instant::now(),
                        sent_at: None,
                        deadline: None,
                        reply: Some(reply),
                        callback,
                    },
                );
                self.counters.submitted += 1;
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Find { id, reply } => {
                let _ = reply.send(self.requests.get(&id).map(|t| t.info(id)));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn limit_for(&self, config: &ServerConfig) -> usize {
        self.max_concurrent.min(self.pool.max_size_for(config))
    }

    /// Launch every queued request whose server has a free slot, highest
    /// priority first, FIFO within a priority.
    fn dispatch_ready(&mut self) {
        for priority in Priority::DESCENDING {
            let p = priority.index();
            let mut i = 0;
            while i < self.queues[p].len() {
                let id = self.queues[p][i];
                let ready = match self.requests.get(&id) {
                    Some(tracked) => {
                        let server = &tracked.config.name;
                        let active = self.active.get(server).copied().unwrap_or(0);
                        !self.blocked.contains(server) && active < self.limit_for(&tracked.config)
                    }
                    None => {
                        self.queues[p].remove(i);
                        continue;
                    }
                };

                if ready {
                    self.queues[p].remove(i);
                    self.launch(id);
                } else {
                    i += 1;
                }
            }
        }
    }

    fn launch(&mut self, id: RequestId) {
        let Some(tracked) = self.requests.get_mut(&id) else {
            return;
        };
        let config = tracked.config.clone();
        let call = tracked.request.call.clone();
        let window = tracked.request.timeout.unwrap_or(self.default_timeout);
        let deadline = *tracked.deadline.get_or_insert_with(|| Instant::now() + window);
        let remaining = deadline.saturating_duration_since(Instant::now());

        let server = config.name.clone();
        *self.active.entry(server.clone()).or_insert(0) += 1;

        let pool = self.pool.clone();
        let progress = self.progress_tx.clone();
        let work = async move {
            match pool.acquire(&config).await {
                Ok(Some(mut conn)) => {
                    let _ = progress.send((id, Progress::Acquired));
                    let on_sent = move || {
                        let _ = progress.send((id, Progress::Sent));
                    };
                    let result = pool
                        .engine()
                        .call_safe_observed(&mut conn, &call, &on_sent)
                        .await;
                    Step::Finished(result)
                }
                Ok(None) => Step::Exhausted(McpError::PoolExhausted {
                    server: config.name.clone(),
                    max_size: pool.max_size_for(&config),
                }),
                Err(e) => Step::Finished(Err(e)),
            }
        };
        let bounded = async move {
            tokio::time::timeout(remaining, work)
                .await
                .unwrap_or(Step::TimedOut)
        };

        let (abortable, handle) = abortable(bounded);
        self.aborts.insert(id, handle);
        self.in_flight.push(Box::pin(async move {
            let outcome = abortable.await;
            match outcome {
                Ok(step) => LoopEvent::Done(id, server, step),
                Err(_) => LoopEvent::Aborted(id, server),
            }
        }));

        self.counters.peak_in_flight = self.counters.peak_in_flight.max(self.aborts.len());
    }

    fn on_progress(&mut self, id: RequestId, progress: Progress) {
        let Some(tracked) = self.requests.get_mut(&id) else {
            return;
        };
        match (progress, tracked.state) {
            (Progress::Acquired, RequestState::Queued) => {
                tracked.state = RequestState::Sending;
            }
            (Progress::Sent, RequestState::Queued | RequestState::Sending) => {
                tracked.state = RequestState::Waiting;
                tracked.sent_at = Some(Utc::now());
            }
            _ => {}
        }
    }

    fn on_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Done(id, server, step) => {
                self.free_slot(&server);
                self.aborts.remove(&id);
                let Some(tracked) = self.requests.get(&id) else {
                    return;
                };
                let window = tracked.request.timeout.unwrap_or(self.default_timeout);
                let priority = tracked.request.priority;
                let expired = tracked.deadline.is_some_and(|d| d <= Instant::now());

                match step {
                    Step::Finished(Ok(value)) => self.resolve(id, RequestState::Completed, Ok(value)),
                    Step::Finished(Err(e)) => self.resolve(id, RequestState::Failed, Err(e)),
                    Step::Exhausted(reason) if !expired => {
                        tracing::debug!(id, error = %reason, "no free connection, requeued");
                        self.queues[priority.index()].push_front(id);
                        if self.blocked.insert(server.clone()) {
                            self.in_flight.push(Box::pin(async move {
                                tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                                LoopEvent::Unblock(server)
                            }));
                        }
                    }
                    // An exhausted pool answers without ever pending, so the
                    // deadline is also checked here.
                    Step::TimedOut | Step::Exhausted(_) => {
                        self.pool.engine().metrics().record_timeout(&server);
                        let timeout_ms = window.as_millis() as u64;
                        self.resolve(
                            id,
                            RequestState::Timeout,
                            Err(McpError::Timeout { server, timeout_ms }),
                        );
                    }
                }
            }
            LoopEvent::Aborted(id, server) => {
                self.free_slot(&server);
                tracing::debug!(id, server = %server, "aborted request released");
            }
            LoopEvent::Unblock(server) => {
                self.blocked.remove(&server);
            }
        }
    }

    fn free_slot(&mut self, server: &str) {
        if let Some(active) = self.active.get_mut(server) {
            *active = active.saturating_sub(1);
            if *active == 0 {
                self.active.remove(server);
            }
        }
    }

    fn cancel(&mut self, id: RequestId) -> bool {
        let Some(tracked) = self.requests.get(&id) else {
            return false;
        };
        let priority = tracked.request.priority;

        self.queues[priority.index()].retain(|queued| *queued != id);
        // Its slot stays taken until the aborted future reports back.
        if let Some(handle) = self.aborts.remove(&id) {
            handle.abort();
        }

        self.resolve(id, RequestState::Cancelled, Err(McpError::Cancelled { id }));
        true
    }

    fn cancel_all(&mut self) {
        for handle in self.aborts.values() {
            handle.abort();
        }
        self.aborts.clear();
        self.active.clear();
        for queue in &mut self.queues {
            queue.clear();
        }

        let mut ids: Vec<RequestId> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.resolve(id, RequestState::Cancelled, Err(McpError::Cancelled { id }));
        }
    }

    fn resolve(
        &mut self,
        id: RequestId,
        state: RequestState,
        result: Result<serde_json::Value, McpError>,
    ) {
        let Some(mut tracked) = self.requests.remove(&id) else {
            return;
        };

        match state {
            RequestState::Completed => self.counters.completed += 1,
            RequestState::Failed => self.counters.failed += 1,
            RequestState::Timeout => self.counters.timed_out += 1,
            RequestState::Cancelled => self.counters.cancelled += 1,
            _ => {}
        }

        let outcome = RequestOutcome {
            id,
            server: tracked.config.name.clone(),
            label: tracked.request.call.label().to_string(),
            priority: tracked.request.priority,
            state,
            result,
            queued_at: tracked.queued_at,
            sent_at: tracked.sent_at,
            completed_at: Utc::now(),
            elapsed: tracked.submitted.elapsed(),
        };

        match &outcome.result {
            Ok(_) => tracing::debug!(
                id,
                server = %outcome.server,
                call = %outcome.label,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "request completed"
            ),
            Err(e) => tracing::warn!(
                id,
                server = %outcome.server,
                call = %outcome.label,
                state = %state,
                error = %e,
                "request did not complete"
            ),
        }

        if let Some(callback) = tracked.callback.take() {
            callback(&outcome);
        }
        if let Some(reply) = tracked.reply.take() {
            let _ = reply.send(outcome);
        }
    }

    fn stats(&self) -> DispatcherStats {
        let mut load: HashMap<&str, ServerLoad> = HashMap::new();
        for queue in &self.queues {
            for id in queue {
                if let Some(tracked) = self.requests.get(id) {
                    let name = tracked.config.name.as_str();
                    load.entry(name)
                        .or_insert_with(|| empty_load(name))
                        .queued += 1;
                }
            }
        }
        for (name, active) in &self.active {
            load.entry(name.as_str())
                .or_insert_with(|| empty_load(name))
                .active = *active;
        }

        let mut servers: Vec<ServerLoad> = load.into_values().collect();
        servers.sort_by(|a, b| a.server.cmp(&b.server));

        DispatcherStats {
            queued: self.queues.iter().map(VecDeque::len).sum(),
            in_flight: self.aborts.len(),
            servers,
            ..self.counters.clone()
        }
    }
}

fn empty_load(server: &str) -> ServerLoad {
    ServerLoad {
        server: server.to_string(),
        queued: 0,
        active: 0,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
