//! Per-server connection pool.
//!
//! Each server gets a bounded list of entries in insertion order. An entry
//! is `active` while its connection is checked out as a `PooledConnection`
//! and `idle` once the token is dropped. Idle entries are probed for
//! liveness before reuse, and evicted after sitting unused past the idle
//! timeout.
//!
//! Invariant per server: `active + idle == total <= max_size`, and
//! `hits + misses` equals the number of acquires that returned a connection.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use super::config::ClientSettings;
use super::connection::Connection;
use super::errors::McpError;
use super::protocol::ProtocolEngine;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_SIZE: usize = 5;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Entries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Active,
    Idle,
}

struct PoolEntry {
    id: Uuid,
    state: EntryState,
    ref_count: usize,
    last_used: Instant,
    /// `None` while checked out, or while the connection is still being opened.
    connection: Option<Connection>,
}

struct ServerPool {
    max_size: usize,
    idle_timeout: Duration,
    entries: Vec<PoolEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    creates: u64,
    destroys: u64,
}

impl ServerPool {
    fn new(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            max_size,
            idle_timeout,
            entries: Vec::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            creates: 0,
            destroys: 0,
        }
    }

    fn stats(&self, server: &str) -> PoolStats {
        let active = self
            .entries
            .iter()
            .filter(|e| e.state == EntryState::Active)
            .count();
        let lookups = self.hits + self.misses;
        PoolStats {
            server: server.to_string(),
            total: self.entries.len(),
            active,
            idle: self.entries.len() - active,
            max_size: self.max_size,
            idle_timeout_secs: self.idle_timeout.as_secs(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            creates: self.creates,
            destroys: self.destroys,
            hit_rate: if lookups > 0 {
                self.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Remove idle entries whose connection fails the liveness probe.
    fn take_dead(&mut self) -> Vec<Connection> {
        let mut dead = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for mut entry in std::mem::take(&mut self.entries) {
            let alive = entry.state == EntryState::Active
                || entry.connection.as_mut().is_some_and(|c| c.is_alive());
            if alive {
                kept.push(entry);
            } else {
                self.evictions += 1;
                self.destroys += 1;
                dead.extend(entry.connection.take());
            }
        }

        self.entries = kept;
        dead
    }

    /// Remove idle entries unused for longer than the idle timeout.
    fn take_expired(&mut self, now: Instant) -> Vec<Connection> {
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for mut entry in std::mem::take(&mut self.entries) {
            let idle_for = now.saturating_duration_since(entry.last_used);
            if entry.state == EntryState::Idle && idle_for > self.idle_timeout {
                self.evictions += 1;
                self.destroys += 1;
                expired.extend(entry.connection.take());
            } else {
                kept.push(entry);
            }
        }

        self.entries = kept;
        expired
    }
}

/// Point-in-time view of one server's pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub server: String,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub max_size: usize,
    pub idle_timeout_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub creates: u64,
    pub destroys: u64,
    pub hit_rate: f64,
}

// ─── Pool ────────────────────────────────────────────────────────────────────

struct PoolShared {
    servers: Mutex<HashMap<String, ServerPool>>,
    engine: Arc<ProtocolEngine>,
    default_max_size: usize,
    default_idle_timeout: Duration,
}

/// Cheap-to-clone handle to the shared pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

enum Checkout {
    Reused(Uuid, Connection),
    Reserved(Uuid),
    Exhausted(usize),
}

impl ConnectionPool {
    pub fn new(
        engine: Arc<ProtocolEngine>,
        default_max_size: usize,
        default_idle_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                servers: Mutex::new(HashMap::new()),
                engine,
                default_max_size: default_max_size.max(1),
                default_idle_timeout,
            }),
        }
    }

    pub fn from_settings(settings: &ClientSettings, engine: Arc<ProtocolEngine>) -> Self {
        Self::new(engine, settings.pool_max_size, settings.idle_timeout())
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.shared.engine
    }

    /// Maximum pool size for `config`, honouring its override.
    pub fn max_size_for(&self, config: &ServerConfig) -> usize {
        config
            .pool_max_size
            .unwrap_or(self.shared.default_max_size)
            .max(1)
    }

    fn idle_timeout_for(&self, config: &ServerConfig) -> Duration {
        config
            .idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.shared.default_idle_timeout)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerPool>> {
        self.shared
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection for `config.name`.
    ///
    /// Reuses a healthy idle entry (hit), or opens and handshakes a new one
    /// when below the maximum (miss). Returns `Ok(None)` when every slot is
    /// checked out. Connection failures propagate and leave no entry behind.
    pub async fn acquire(
        &self,
        config: &Arc<ServerConfig>,
    ) -> Result<Option<PooledConnection>, McpError> {
        let server = config.name.clone();
        let now = Instant::now();

        let (checkout, dead) = {
            let max_size = self.max_size_for(config);
            let idle_timeout = self.idle_timeout_for(config);
            let mut servers = self.lock();
            let pool = servers
                .entry(server.clone())
                .or_insert_with(|| ServerPool::new(max_size, idle_timeout));

            let dead = pool.take_dead();

            let mut reused = None;
            for entry in pool
                .entries
                .iter_mut()
                .filter(|e| e.state == EntryState::Idle)
            {
                if let Some(conn) = entry.connection.take() {
                    entry.state = EntryState::Active;
                    entry.ref_count = 1;
                    entry.last_used = now;
                    reused = Some((entry.id, conn));
                    break;
                }
            }

            let checkout = match reused {
                Some((id, conn)) => {
                    pool.hits += 1;
                    Checkout::Reused(id, conn)
                }
                None if pool.entries.len() < pool.max_size => {
                    let id = Uuid::new_v4();
                    pool.entries.push(PoolEntry {
                        id,
                        state: EntryState::Active,
                        ref_count: 1,
                        last_used: now,
                        connection: None,
                    });
                    Checkout::Reserved(id)
                }
                None => Checkout::Exhausted(pool.max_size),
            };
            (checkout, dead)
        };

        if !dead.is_empty() {
            tracing::debug!(server = %server, count = dead.len(), "evicting dead idle connections");
            for mut conn in dead {
                conn.disconnect().await;
            }
        }

        match checkout {
            Checkout::Reused(entry_id, conn) => {
                tracing::debug!(server = %server, conn = %conn.id(), "pool hit");
                Ok(Some(PooledConnection {
                    pool: self.clone(),
                    entry_id,
                    conn,
                }))
            }
            Checkout::Exhausted(max_size) => {
                tracing::debug!(server = %server, max_size, "pool exhausted");
                Ok(None)
            }
            Checkout::Reserved(entry_id) => {
                let mut reservation = Reservation {
                    pool: self,
                    server: &server,
                    entry_id,
                    armed: true,
                };

                let mut conn = Connection::new(config.clone());
                self.shared.engine.connect_with_retry(&mut conn).await?;

                reservation.commit();
                tracing::debug!(server = %server, conn = %conn.id(), "pool miss, connection created");
                Ok(Some(PooledConnection {
                    pool: self.clone(),
                    entry_id,
                    conn,
                }))
            }
        }
    }

    /// Return a checked-out connection. Never closes it; a connection whose
    /// entry no longer exists (pool shut down) is closed instead.
    fn release_entry(&self, server: &str, entry_id: Uuid, conn: Connection) {
        let mut servers = self.lock();
        let entry = servers
            .get_mut(server)
            .and_then(|pool| pool.entries.iter_mut().find(|e| e.id == entry_id));

        match entry {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    entry.state = EntryState::Idle;
                    entry.last_used = Instant::now();
                }
                entry.connection = Some(conn);
            }
            None => {
                drop(servers);
                close_detached(conn);
            }
        }
    }

    /// Evict idle entries past their idle timeout. `None` sweeps every server.
    /// Returns the number of connections closed.
    pub async fn evict_idle(&self, server: Option<&str>) -> usize {
        self.evict_idle_at(server, Instant::now()).await
    }

    /// `evict_idle` as observed at `now`.
    pub async fn evict_idle_at(&self, server: Option<&str>, now: Instant) -> usize {
        let expired: Vec<Connection> = {
            let mut servers = self.lock();
            servers
                .iter_mut()
                .filter(|(name, _)| server.map_or(true, |s| s == name.as_str()))
                .flat_map(|(_, pool)| pool.take_expired(now))
                .collect()
        };

        let count = expired.len();
        for mut conn in expired {
            tracing::info!(server = %conn.server_name(), conn = %conn.id(), "evicting idle connection");
            conn.disconnect().await;
        }
        count
    }

    pub fn stats(&self, server: &str) -> Option<PoolStats> {
        self.lock().get(server).map(|pool| pool.stats(server))
    }

    /// Stats of every server with a pool, sorted by name.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let servers = self.lock();
        let mut stats: Vec<PoolStats> = servers
            .iter()
            .map(|(name, pool)| pool.stats(name))
            .collect();
        stats.sort_by(|a, b| a.server.cmp(&b.server));
        stats
    }

    /// Tear down every pool. Idle connections are closed now; checked-out
    /// ones are closed when their token is dropped. Returns the number of
    /// connections closed.
    pub async fn shutdown(&self) -> usize {
        let idle: Vec<Connection> = {
            let mut servers = self.lock();
            servers
                .drain()
                .flat_map(|(_, pool)| pool.entries)
                .filter_map(|entry| entry.connection)
                .collect()
        };

        let count = idle.len();
        for mut conn in idle {
            conn.disconnect().await;
        }
        tracing::info!(closed = count, "connection pool shut down");
        count
    }
}

/// Close a connection that has no pool entry to return to.
fn close_detached(mut conn: Connection) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { conn.disconnect().await });
        }
        Err(_) => drop(conn),
    }
}

/// Slot reserved while a new connection is opened. Dropped without
/// `commit` (connect failure or cancellation) it frees the slot.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    server: &'a str,
    entry_id: Uuid,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(&mut self) {
        self.armed = false;
        let mut servers = self.pool.lock();
        if let Some(pool) = servers.get_mut(self.server) {
            pool.misses += 1;
            pool.creates += 1;
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut servers = self.pool.lock();
        if let Some(pool) = servers.get_mut(self.server) {
            pool.entries.retain(|e| e.id != self.entry_id);
        }
    }
}

// ─── Checked-out token ───────────────────────────────────────────────────────

/// A connection checked out of the pool. Dropping it returns the entry.
pub struct PooledConnection {
    pool: ConnectionPool,
    entry_id: Uuid,
    conn: Connection,
}

impl PooledConnection {
    pub fn entry_id(&self) -> Uuid {
        self.entry_id
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let placeholder = Connection::new(self.conn.config().clone());
        let conn = std::mem::replace(&mut self.conn, placeholder);
        let server = conn.server_name().to_string();
        self.pool.release_entry(&server, self.entry_id, conn);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::mcp_client::metrics::MetricsRegistry;
    use crate::mcp_client::protocol::RetryPolicy;
    use crate::mcp_client::test_support::{FakeBehavior, FakeServer};

    fn pool() -> ConnectionPool {
        let metrics = Arc::new(MetricsRegistry::new());
        let engine = ProtocolEngine::new(&ClientSettings::default(), metrics).with_retry(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        );
        ConnectionPool::new(Arc::new(engine), DEFAULT_MAX_SIZE, DEFAULT_IDLE_TIMEOUT)
    }

    #[tokio::test]
    async fn test_sequential_acquires_reuse_one_connection() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake").with_pool_max_size(2));
        let pool = pool();

        let mut first_id = None;
        for _ in 0..3 {
            let conn = pool.acquire(&config).await.unwrap().unwrap();
            assert!(conn.is_connected());
            first_id.get_or_insert(conn.id());
            assert_eq!(Some(conn.id()), first_id);
        }

        let stats = pool.stats("fake").unwrap();
        assert_eq!(stats.creates, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!((stats.idle, stats.active, stats.total), (1, 0, 1));
        assert_eq!(stats.max_size, 2);
        assert_eq!(server.stats.connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_returns_none() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake").with_pool_max_size(2));
        let pool = pool();

        let a = pool.acquire(&config).await.unwrap().unwrap();
        let b = pool.acquire(&config).await.unwrap().unwrap();
        assert_ne!(a.entry_id(), b.entry_id());
        assert!(pool.acquire(&config).await.unwrap().is_none());

        let stats = pool.stats("fake").unwrap();
        assert_eq!((stats.active, stats.idle, stats.total), (2, 0, 2));
        assert_eq!(stats.hits + stats.misses, 2);

        drop(a);
        let c = pool.acquire(&config).await.unwrap();
        assert!(c.is_some());
        assert_eq!(pool.stats("fake").unwrap().hits, 1);
        drop(b);
    }

    #[tokio::test]
    async fn test_dead_idle_entry_is_evicted_on_acquire() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake"));
        let pool = pool();

        let mut conn = pool.acquire(&config).await.unwrap().unwrap();
        conn.disconnect().await;
        drop(conn);
        assert_eq!(pool.stats("fake").unwrap().idle, 1);

        let conn = pool.acquire(&config).await.unwrap().unwrap();
        assert!(conn.is_connected());
        drop(conn);

        let stats = pool.stats("fake").unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.destroys, 1);
        assert_eq!(stats.creates, 2);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_idle_sweep_evicts_expired_entries() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake"));
        let pool = pool();

        drop(pool.acquire(&config).await.unwrap().unwrap());
        let now = Instant::now();

        assert_eq!(pool.evict_idle_at(None, now + Duration::from_secs(299)).await, 0);
        assert_eq!(pool.stats("fake").unwrap().total, 1);

        assert_eq!(pool.evict_idle_at(Some("fake"), now + Duration::from_secs(301)).await, 1);
        let stats = pool.stats("fake").unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_override() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake").with_idle_timeout(Duration::from_secs(10)));
        let pool = pool();

        drop(pool.acquire(&config).await.unwrap().unwrap());
        let stats = pool.stats("fake").unwrap();
        assert_eq!(stats.idle_timeout_secs, 10);

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(pool.evict_idle_at(None, later).await, 1);
    }

    #[tokio::test]
    async fn test_active_entries_are_not_swept() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake"));
        let pool = pool();

        let held = pool.acquire(&config).await.unwrap().unwrap();
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(pool.evict_idle_at(None, later).await, 0);
        assert_eq!(pool.stats("fake").unwrap().active, 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_failed_connect_frees_reserved_slot() {
        let pool = pool();
        let config = Arc::new(ServerConfig::socket("ghost", "/tmp/mcp-conduit-no-such.sock"));

        let err = pool.acquire(&config).await.err().unwrap();
        assert!(matches!(err, McpError::RetryExhausted { .. }));

        let stats = pool.stats("ghost").unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.creates, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_detaches_active() {
        let server = FakeServer::start(FakeBehavior::default());
        let config = Arc::new(server.config("fake"));
        let pool = pool();

        let held = pool.acquire(&config).await.unwrap().unwrap();
        drop(pool.acquire(&config).await.unwrap().unwrap());
        assert_eq!(pool.stats("fake").unwrap().total, 2);

        assert_eq!(pool.shutdown().await, 1);
        assert!(pool.stats("fake").is_none());

        // Returning a token after teardown closes its connection.
        drop(held);
        assert!(pool.all_stats().is_empty());
    }
}
