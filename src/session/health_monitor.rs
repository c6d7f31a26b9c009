//! Pure health monitoring and reconnection logic for the session engine
//!
//! This module contains pure functions for reconnection decision making,
//! the keepalive schedule, state transition logging and health metrics.

use super::connection::{ConnectionState, ReconnectConfig, RetryState};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

/// Why automatic reconnection is switched off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Explicit disconnect by the caller
    UserDisconnect,
    /// Credential missing or rejected
    AuthFailure,
    /// Attempt ceiling reached
    Exhausted,
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Schedule attempt number `attempt` after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Reconnection switched off
    AbortSuppressed(Suppression),
    /// No target to redial
    AbortNoTarget,
    /// Attempt ceiling reached
    AbortMaxAttemptsExceeded,
}

/// Connection events that drive state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket open requested
    AttemptStarted,
    /// Credential frame sent
    AuthenticationStarted,
    /// Bootstrap completed
    SessionEstablished,
    /// Attempt or live connection failed
    Failure(String),
    /// Caller disconnected
    UserDisconnected,
}

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    pub fn should_attempt_reconnection(
        retry: &RetryState,
        config: &ReconnectConfig,
        has_target: bool,
        suppression: Option<Suppression>,
    ) -> ReconnectionDecision {
        if let Some(reason) = suppression {
            return ReconnectionDecision::AbortSuppressed(reason);
        }
        if !has_target {
            return ReconnectionDecision::AbortNoTarget;
        }
        if retry.attempt_count >= retry.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = retry.attempt_count + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::AttemptStarted => ConnectionState::Connecting,
            ConnectionEvent::AuthenticationStarted => ConnectionState::Authenticating,
            ConnectionEvent::SessionEstablished => ConnectionState::Connected,
            ConnectionEvent::Failure(reason) => ConnectionState::Error(reason),
            ConnectionEvent::UserDisconnected => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows sending requests (pure function)
    pub fn can_send(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(channel: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected)
            | (ConnectionState::Authenticating, ConnectionState::Connected) => {
                info!(channel, "Session established");
            }
            (ConnectionState::Connected, ConnectionState::Error(reason)) => {
                warn!(channel, reason = %reason, "Connection lost");
            }
            (ConnectionState::Error(_), ConnectionState::Connecting) => {
                info!(channel, "Reconnecting");
            }
            (_, ConnectionState::Error(reason)) => {
                error!(channel, reason = %reason, "Connection failed");
            }
            _ => {
                info!(channel, "Connection state: {} -> {}", from, to);
            }
        }
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        connected_at: Option<Instant>,
        last_frame_at: Option<Instant>,
        reconnect_count: u32,
        keepalive_interval: Duration,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connected_at.map(|t| now.duration_since(t));
        let time_since_last_frame = last_frame_at.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_frame,
            reconnect_count,
            is_healthy: Self::determine_health_status(
                uptime,
                time_since_last_frame,
                keepalive_interval,
            ),
        }
    }

    /// Connected and heard from the server within three keepalive periods
    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_frame: Option<Duration>,
        keepalive_interval: Duration,
    ) -> bool {
        match (uptime, time_since_last_frame) {
            (Some(_), None) => true,
            (Some(_), Some(quiet)) => quiet < keepalive_interval.saturating_mul(3),
            _ => false,
        }
    }
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current session was established
    pub uptime: Option<Duration>,
    /// Time since any inbound frame
    pub time_since_last_frame: Option<Duration>,
    /// Current reconnection attempt count
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

/// Liveness probe timer tied to the Connected state
///
/// At most one probe is ever scheduled: the next deadline is set only after
/// the previous probe was sent.
#[derive(Debug, Clone)]
pub struct KeepaliveSchedule {
    interval: Duration,
    next_probe: Option<Instant>,
}

impl KeepaliveSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_probe: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.next_probe = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next_probe = None;
    }

    pub fn next_probe(&self) -> Option<Instant> {
        self.next_probe
    }

    pub fn is_running(&self) -> bool {
        self.next_probe.is_some()
    }

    /// Reschedule after a probe went out
    pub fn probe_sent(&mut self, now: Instant) {
        if self.next_probe.is_some() {
            self.next_probe = Some(now + self.interval);
        }
    }
}
