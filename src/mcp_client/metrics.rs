//! Per-server performance metrics.
//!
//! Always-on and bounded in memory:
//! - a ring buffer of the last 1000 call latencies (microseconds)
//! - call counters and success rate
//! - at most 32 named error-type counters per server (extra types are dropped)
//! - throughput accumulators since the last window start
//! - health fields: connected-at, last activity, reconnections, timeouts
//!
//! Latency statistics are recomputed lazily: each new sample marks them
//! dirty and `snapshot` recomputes them once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Capacity of the latency ring buffer.
pub const LATENCY_CAPACITY: usize = 1000;

/// Distinct error types tracked per server.
pub const MAX_ERROR_TYPES: usize = 32;

/// Success rate at or above which a server with recent activity is healthy.
const HEALTHY_SUCCESS_RATE: f64 = 0.8;

/// Activity older than this makes a server degraded.
const ACTIVITY_WINDOW: Duration = Duration::from_secs(300);

// ─── Latency ─────────────────────────────────────────────────────────────────

/// Fixed-capacity ring buffer; the oldest sample is overwritten when full.
#[derive(Debug, Clone)]
pub struct LatencyRing {
    samples: Vec<u64>,
    next: usize,
    capacity: usize,
}

impl LatencyRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples oldest first.
    pub fn recent(&self) -> Vec<u64> {
        if self.samples.len() < self.capacity {
            return self.samples.clone();
        }
        let mut ordered = Vec::with_capacity(self.capacity);
        ordered.extend_from_slice(&self.samples[self.next..]);
        ordered.extend_from_slice(&self.samples[..self.next]);
        ordered
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }

    fn as_slice(&self) -> &[u64] {
        &self.samples
    }
}

/// Summary of the latency buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: f64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    /// Compute from an unordered sample set. Percentiles are taken by
    /// index `floor((n - 1) * p)` into the sorted samples.
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        let sum: u128 = sorted.iter().map(|&s| s as u128).sum();

        Self {
            count: n,
            min_us: sorted[0],
            max_us: sorted[n - 1],
            avg_us: sum as f64 / n as f64,
            p95_us: sorted[percentile_index(n, 0.95)],
            p99_us: sorted[percentile_index(n, 0.99)],
        }
    }
}

fn percentile_index(n: usize, p: f64) -> usize {
    (((n - 1) as f64) * p).floor() as usize
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Count of one named error type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorTypeCount {
    pub error_type: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Bytes and messages since the window start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_per_sec: f64,
    pub messages_per_sec: f64,
    pub window_secs: f64,
}

/// Derived server status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    /// No calls recorded yet.
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Degraded => f.write_str("degraded"),
            HealthStatus::Unknown => f.write_str("N/A"),
        }
    }
}

/// Health fields at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Health {
    /// Time since the last (re)connection over time since the record was created.
    pub uptime_ratio: f64,
    pub reconnections: u32,
    pub timeouts: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub secs_since_activity: Option<u64>,
}

/// Immutable copy of one server's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub server: String,
    pub taken_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// `None` until at least one call is recorded.
    pub success_rate: Option<f64>,
    /// `None` while the latency buffer is empty.
    pub latency: Option<LatencyStats>,
    pub throughput: Throughput,
    pub health: Health,
    pub error_types: Vec<ErrorTypeCount>,
    pub top_error: Option<ErrorTypeCount>,
    pub status: HealthStatus,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Server: {} ({})", self.server, self.status)?;

        match self.success_rate {
            Some(rate) => writeln!(
                f,
                "  Calls: {} total, {} ok, {} failed ({:.1}% success)",
                self.total_calls,
                self.successful_calls,
                self.failed_calls,
                rate * 100.0
            )?,
            None => writeln!(f, "  Calls: N/A")?,
        }

        match &self.latency {
            Some(l) => writeln!(
                f,
                "  Latency: min {}us, avg {:.1}us, p95 {}us, p99 {}us, max {}us",
                l.min_us, l.avg_us, l.p95_us, l.p99_us, l.max_us
            )?,
            None => writeln!(f, "  Latency: N/A")?,
        }

        let t = &self.throughput;
        writeln!(
            f,
            "  Throughput: {} B sent, {} B received, {:.1} B/s, {:.2} msg/s",
            t.bytes_sent, t.bytes_received, t.bytes_per_sec, t.messages_per_sec
        )?;

        let h = &self.health;
        match h.secs_since_activity {
            Some(idle) => writeln!(
                f,
                "  Health: uptime {:.1}%, reconnections {}, timeouts {}, last activity {idle}s ago",
                h.uptime_ratio * 100.0,
                h.reconnections,
                h.timeouts
            )?,
            None => writeln!(
                f,
                "  Health: uptime {:.1}%, reconnections {}, timeouts {}, last activity N/A",
                h.uptime_ratio * 100.0,
                h.reconnections,
                h.timeouts
            )?,
        }

        match &self.top_error {
            Some(e) => write!(f, "  Top error: {} ({})", e.error_type, e.count),
            None => write!(f, "  Top error: N/A"),
        }
    }
}

// ─── Per-server record ───────────────────────────────────────────────────────

#[derive(Debug)]
struct ServerMetrics {
    created_at: Instant,
    created_wall: DateTime<Utc>,

    latency: LatencyRing,
    latency_stats: LatencyStats,
    dirty: bool,

    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,

    errors: Vec<ErrorTypeCount>,

    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
    window_start: Instant,

    connected_at: Instant,
    last_activity: Option<(Instant, DateTime<Utc>)>,
    reconnections: u32,
    timeouts: u64,
}

impl ServerMetrics {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            created_wall: Utc::now(),
            latency: LatencyRing::with_capacity(LATENCY_CAPACITY),
            latency_stats: LatencyStats::default(),
            dirty: false,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            errors: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            window_start: now,
            connected_at: now,
            last_activity: None,
            reconnections: 0,
            timeouts: 0,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Some((Instant::now(), Utc::now()));
    }

    fn reset(&mut self) {
        self.latency.clear();
        self.latency_stats = LatencyStats::default();
        self.dirty = false;
        self.total_calls = 0;
        self.successful_calls = 0;
        self.failed_calls = 0;
        self.errors.clear();
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.messages_sent = 0;
        self.messages_received = 0;
        self.window_start = Instant::now();
        self.reconnections = 0;
        self.timeouts = 0;
    }

    fn snapshot(&mut self, server: &str) -> MetricsSnapshot {
        if self.dirty {
            self.latency_stats = LatencyStats::from_samples(self.latency.as_slice());
            self.dirty = false;
        }

        let now = Instant::now();
        let window = now.saturating_duration_since(self.window_start).as_secs_f64();
        let rate = |count: u64| if window > 0.0 { count as f64 / window } else { 0.0 };

        let total = now.saturating_duration_since(self.created_at).as_secs_f64();
        let connected = now.saturating_duration_since(self.connected_at).as_secs_f64();
        let uptime_ratio = if total > 0.0 {
            (connected / total).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let success_rate = (self.total_calls > 0)
            .then(|| self.successful_calls as f64 / self.total_calls as f64);
        let secs_since_activity = self
            .last_activity
            .map(|(at, _)| now.saturating_duration_since(at).as_secs());

        let status = match (success_rate, secs_since_activity) {
            (None, _) => HealthStatus::Unknown,
            (Some(rate), Some(idle))
                if rate >= HEALTHY_SUCCESS_RATE && idle <= ACTIVITY_WINDOW.as_secs() =>
            {
                HealthStatus::Healthy
            }
            _ => HealthStatus::Degraded,
        };

        let top_error = self
            .errors
            .iter()
            .fold(None::<&ErrorTypeCount>, |best, e| match best {
                Some(b) if b.count >= e.count => Some(b),
                _ => Some(e),
            })
            .cloned();

        MetricsSnapshot {
            server: server.to_string(),
            taken_at: Utc::now(),
            created_at: self.created_wall,
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            success_rate,
            latency: (!self.latency.is_empty()).then_some(self.latency_stats),
            throughput: Throughput {
                bytes_sent: self.bytes_sent,
                bytes_received: self.bytes_received,
                messages_sent: self.messages_sent,
                messages_received: self.messages_received,
                bytes_per_sec: rate(self.bytes_sent + self.bytes_received),
                messages_per_sec: rate(self.messages_sent + self.messages_received),
                window_secs: window,
            },
            health: Health {
                uptime_ratio,
                reconnections: self.reconnections,
                timeouts: self.timeouts,
                last_activity: self.last_activity.map(|(_, wall)| wall),
                secs_since_activity,
            },
            error_types: self.errors.clone(),
            top_error,
            status,
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Metrics for every server referenced so far, keyed by server name.
///
/// A record is created the first time a server is referenced and lives for
/// the life of the registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    servers: Mutex<HashMap<String, ServerMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_server<R>(&self, server: &str, f: impl FnOnce(&mut ServerMetrics) -> R) -> R {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        let record = servers
            .entry(server.to_string())
            .or_insert_with(ServerMetrics::new);
        f(record)
    }

    /// Record one completed call and its latency.
    pub fn record_call(&self, server: &str, latency_us: u64, success: bool) {
        self.with_server(server, |m| {
            m.latency.push(latency_us);
            m.dirty = true;
            m.total_calls += 1;
            if success {
                m.successful_calls += 1;
            } else {
                m.failed_calls += 1;
            }
            m.touch();
        });
    }

    /// Count one occurrence of `error_type`. New types beyond the table
    /// capacity are dropped.
    pub fn record_error(&self, server: &str, error_type: &str) {
        self.with_server(server, |m| {
            let now = Utc::now();
            if let Some(entry) = m.errors.iter_mut().find(|e| e.error_type == error_type) {
                entry.count += 1;
                entry.last_seen = now;
            } else if m.errors.len() < MAX_ERROR_TYPES {
                m.errors.push(ErrorTypeCount {
                    error_type: error_type.to_string(),
                    count: 1,
                    last_seen: now,
                });
            } else {
                tracing::debug!(server, error_type, "error type table full, dropping");
            }
        });
    }

    pub fn record_bytes(&self, server: &str, sent: u64, received: u64) {
        self.with_server(server, |m| {
            m.bytes_sent += sent;
            m.bytes_received += received;
            if sent > 0 {
                m.messages_sent += 1;
            }
            if received > 0 {
                m.messages_received += 1;
            }
        });
    }

    pub fn record_reconnection(&self, server: &str) {
        self.with_server(server, |m| {
            m.reconnections += 1;
            m.connected_at = Instant::now();
            m.touch();
        });
    }

    pub fn record_timeout(&self, server: &str) {
        self.with_server(server, |m| m.timeouts += 1);
    }

    /// Snapshot of one server, or `None` if it was never referenced.
    pub fn snapshot(&self, server: &str) -> Option<MetricsSnapshot> {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers.get_mut(server).map(|m| m.snapshot(server))
    }

    /// Snapshots of all servers, sorted by name.
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<MetricsSnapshot> = servers
            .iter_mut()
            .map(|(name, m)| m.snapshot(name))
            .collect();
        snapshots.sort_by(|a, b| a.server.cmp(&b.server));
        snapshots
    }

    /// Zero the counters and latency buffer. Creation time is kept.
    /// Returns false if the server has no record.
    pub fn reset(&self, server: &str) -> bool {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        match servers.get_mut(server) {
            Some(m) => {
                m.reset();
                true
            }
            None => false,
        }
    }

    pub fn servers(&self) -> Vec<String> {
        let servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = servers.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_most_recent_capacity_samples() {
        let mut ring = LatencyRing::with_capacity(LATENCY_CAPACITY);
        for i in 0..1500u64 {
            ring.push(i);
        }
        assert_eq!(ring.len(), LATENCY_CAPACITY);
        let recent = ring.recent();
        assert_eq!(recent.first(), Some(&500));
        assert_eq!(recent.last(), Some(&1499));
        assert_eq!(recent, (500..1500).collect::<Vec<_>>());
    }

    #[test]
    fn test_percentiles_match_sorted_copy() {
        let registry = MetricsRegistry::new();
        let samples: Vec<u64> = (0..1000u64).map(|i| (i * 7919) % 10_007 + 50).collect();
        for &s in &samples {
            registry.record_call("srv", s, true);
        }

        let mut sorted = samples.clone();
        sorted.sort_unstable();

        let snap = registry.snapshot("srv").unwrap();
        let latency = snap.latency.unwrap();
        assert_eq!(latency.count, 1000);
        assert_eq!(latency.min_us, sorted[0]);
        assert_eq!(latency.max_us, sorted[999]);
        assert_eq!(latency.p95_us, sorted[949]);
        assert_eq!(latency.p99_us, sorted[989]);
        let avg = sorted.iter().sum::<u64>() as f64 / 1000.0;
        assert!((latency.avg_us - avg).abs() < 1e-6);
    }

    #[test]
    fn test_percentile_ordering_small_sets() {
        for n in 1..50u64 {
            let samples: Vec<u64> = (0..n).map(|i| (i * 31) % 17).collect();
            let stats = LatencyStats::from_samples(&samples);
            assert!(stats.min_us <= stats.p95_us);
            assert!(stats.p95_us <= stats.p99_us);
            assert!(stats.p99_us <= stats.max_us);
        }
    }

    #[test]
    fn test_snapshot_only_recomputes_when_dirty() {
        let registry = MetricsRegistry::new();
        registry.record_call("srv", 100, true);
        let first = registry.snapshot("srv").unwrap();
        let second = registry.snapshot("srv").unwrap();
        assert_eq!(first.latency, second.latency);
        assert_eq!(second.total_calls, 1);

        registry.record_call("srv", 300, false);
        let third = registry.snapshot("srv").unwrap();
        assert_eq!(third.latency.unwrap().max_us, 300);
        assert_eq!(third.failed_calls, 1);
        assert_eq!(third.success_rate, Some(0.5));
    }

    #[test]
    fn test_error_types_are_bounded() {
        let registry = MetricsRegistry::new();
        for i in 0..40 {
            registry.record_error("srv", &format!("type_{i}"));
        }
        registry.record_error("srv", "type_3");
        registry.record_error("srv", "type_3");
        registry.record_error("srv", "type_39");

        let snap = registry.snapshot("srv").unwrap();
        assert_eq!(snap.error_types.len(), MAX_ERROR_TYPES);
        assert!(snap.error_types.iter().all(|e| e.error_type != "type_39"));
        let top = snap.top_error.unwrap();
        assert_eq!(top.error_type, "type_3");
        assert_eq!(top.count, 3);
    }

    #[test]
    fn test_bytes_and_health_counters() {
        let registry = MetricsRegistry::new();
        registry.record_bytes("srv", 120, 0);
        registry.record_bytes("srv", 0, 480);
        registry.record_timeout("srv");
        registry.record_reconnection("srv");

        let snap = registry.snapshot("srv").unwrap();
        assert_eq!(snap.throughput.bytes_sent, 120);
        assert_eq!(snap.throughput.bytes_received, 480);
        assert_eq!(snap.throughput.messages_sent, 1);
        assert_eq!(snap.throughput.messages_received, 1);
        assert_eq!(snap.health.timeouts, 1);
        assert_eq!(snap.health.reconnections, 1);
        assert!(snap.health.uptime_ratio <= 1.0);
    }

    #[test]
    fn test_reset_preserves_creation_time() {
        let registry = MetricsRegistry::new();
        registry.record_call("srv", 10, true);
        registry.record_error("srv", "transport");
        let before = registry.snapshot("srv").unwrap();

        assert!(registry.reset("srv"));
        let after = registry.snapshot("srv").unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.total_calls, 0);
        assert!(after.latency.is_none());
        assert!(after.top_error.is_none());
        assert_eq!(after.status, HealthStatus::Unknown);

        assert!(!registry.reset("unknown"));
    }

    #[test]
    fn test_status_and_display() {
        let registry = MetricsRegistry::new();
        assert!(registry.snapshot("srv").is_none());

        registry.record_timeout("srv");
        let empty = registry.snapshot("srv").unwrap();
        assert_eq!(empty.status, HealthStatus::Unknown);
        let text = empty.to_string();
        assert!(text.contains("Calls: N/A"));
        assert!(text.contains("Latency: N/A"));
        assert!(text.contains("Top error: N/A"));

        for _ in 0..9 {
            registry.record_call("srv", 200, true);
        }
        registry.record_call("srv", 900, false);
        let snap = registry.snapshot("srv").unwrap();
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert!(snap.to_string().starts_with("Server: srv (healthy)"));

        for _ in 0..10 {
            registry.record_call("srv", 200, false);
        }
        assert_eq!(registry.snapshot("srv").unwrap().status, HealthStatus::Degraded);
        assert_eq!(registry.servers(), vec!["srv".to_string()]);
    }
}
