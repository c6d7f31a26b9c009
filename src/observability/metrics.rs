//! Thread-safe metrics collection for session engines
//!
//! Each engine owns one collector shared with its handles. Counters are
//! atomics written by the engine task; snapshots can be taken from anywhere.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Latency samples kept for percentile calculation
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    channel: &'static str,

    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    auth_failures: AtomicU64,
    connected_since: AtomicU64,
    last_connected_at: AtomicU64,

    // Traffic
    requests_sent: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_timed_out: AtomicU64,
    notifications_sent: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    events_dispatched: AtomicU64,
    keepalives_sent: AtomicU64,

    // Request latency (mutex protected for complex operations)
    latencies: Mutex<Vec<u64>>, // in milliseconds
}

impl MetricsCollector {
    pub fn new(channel: &'static str) -> Self {
        Self {
            channel,
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            connected_since: AtomicU64::new(0),
            last_connected_at: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }

    // Connection lifecycle metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        let now = current_timestamp_millis();
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since.store(now, Ordering::Relaxed);
        self.last_connected_at.store(now, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connection_lost();
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Traffic metrics
    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self, latency: Duration, success: bool) {
        if success {
            self.requests_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.record_latency(latency);
    }

    pub fn requests_failed(&self, count: usize) {
        self.requests_failed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn requests_timed_out(&self, count: usize) {
        self.requests_timed_out
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.latencies.lock() {
            samples.push(latency.as_millis() as u64);

            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    /// Calculate latency statistics (pure function)
    fn calculate_latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(samples) = self.latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if samples.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let since = self.connected_since.load(Ordering::Relaxed);
        if since == 0 {
            0
        } else {
            now.saturating_sub(since) / 1000
        }
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp_millis();
        let (avg_latency_ms, latency_p50_ms, latency_p95_ms) = self.calculate_latency_statistics();

        MetricsSnapshot {
            channel: self.channel.to_string(),
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
                auth_failures: self.auth_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
                last_connected_at: to_datetime(self.last_connected_at.load(Ordering::Relaxed)),
            },
            traffic: TrafficMetrics {
                requests_sent: self.requests_sent.load(Ordering::Relaxed),
                requests_completed: self.requests_completed.load(Ordering::Relaxed),
                requests_failed: self.requests_failed.load(Ordering::Relaxed),
                requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
                notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
                frames_sent: self.frames_sent.load(Ordering::Relaxed),
                frames_received: self.frames_received.load(Ordering::Relaxed),
                frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
                events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
                keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
                avg_latency_ms,
                latency_p50_ms,
                latency_p95_ms,
            },
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub channel: String,
    pub connection: ConnectionMetrics,
    pub traffic: TrafficMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects_scheduled: u64,
    pub auth_failures: u64,
    pub connection_duration_seconds: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficMetrics {
    pub requests_sent: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub notifications_sent: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub events_dispatched: u64,
    pub keepalives_sent: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
}

// Helper functions
fn current_timestamp_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn to_datetime(millis: u64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}
