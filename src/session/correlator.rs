//! Request correlation
//!
//! Tracks in-flight requests by correlation id. Every entry is resolved
//! exactly once: by a matching reply, by its deadline, or by bulk failure when
//! the connection goes away. Resolution removes the entry, so a late reply
//! finds nothing to resolve.

use crate::error::{SessionError, SessionResult, TimeoutKind};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Single-assignment completion slot handed back to the caller
pub type Completion = oneshot::Sender<SessionResult<Value>>;

/// One in-flight request
#[derive(Debug)]
pub struct PendingRequest {
    pub command: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    completion: Completion,
}

/// Owns the pending-request table
#[derive(Debug)]
pub struct RequestCorrelator {
    pending: HashMap<String, PendingRequest>,
    timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Fresh random id, never one that is still outstanding
    pub fn allocate_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&mut self, message_id: String, command: &str, completion: Completion) {
        let issued_at = Instant::now();
        self.pending.insert(
            message_id,
            PendingRequest {
                command: command.to_string(),
                issued_at,
                deadline: issued_at + self.timeout,
                completion,
            },
        );
    }

    /// Resolve the entry for `message_id`
    ///
    /// Returns the request latency, or `None` when nothing is waiting.
    pub fn resolve(&mut self, message_id: &str, result: SessionResult<Value>) -> Option<Duration> {
        let request = self.pending.remove(message_id)?;
        let elapsed = request.issued_at.elapsed();
        debug!(
            message_id,
            command = %request.command,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "Request resolved"
        );
        // The caller may have gone away; the entry is removed either way
        let _ = request.completion.send(result);
        Some(elapsed)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest deadline among outstanding entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Fail every entry whose deadline has passed; returns how many expired
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now || p.completion.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        let mut timed_out = 0;
        for id in expired {
            if let Some(request) = self.pending.remove(&id) {
                if request.completion.is_closed() {
                    continue;
                }
                debug!(message_id = %id, command = %request.command, "Request timed out");
                let _ = request
                    .completion
                    .send(Err(SessionError::Timeout(TimeoutKind::Request)));
                timed_out += 1;
            }
        }
        timed_out
    }

    /// Resolve every outstanding entry with `error`; returns how many
    pub fn fail_all(&mut self, error: &SessionError) -> usize {
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.completion.send(Err(error.clone()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_allocated_ids_are_distinct() {
        let mut correlator = RequestCorrelator::new(Duration::from_secs(30));
        let mut seen = HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..1000 {
            let id = correlator.allocate_id();
            assert!(seen.insert(id.clone()), "duplicate id {id}");
            let (tx, rx) = oneshot::channel();
            correlator.register(id, "noop", tx);
            receivers.push(rx);
        }
        assert_eq!(correlator.len(), 1000);
    }

    #[tokio::test]
    async fn test_resolve_delivers_exactly_once() {
        let mut correlator = RequestCorrelator::new(Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        let id = correlator.allocate_id();
        correlator.register(id.clone(), "players/all", tx);

        assert!(correlator.resolve(&id, Ok(json!([1]))).is_some());
        assert!(
            correlator.resolve(&id, Ok(json!([2]))).is_none(),
            "second reply ignored"
        );
        assert_eq!(rx.await.unwrap().unwrap(), json!([1]));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let mut correlator = RequestCorrelator::new(Duration::from_secs(30));
        assert!(correlator.resolve("nope", Ok(Value::Null)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_times_out_only_due_entries() {
        let mut correlator = RequestCorrelator::new(Duration::from_secs(30));

        let (early_tx, early_rx) = oneshot::channel();
        correlator.register("early".to_string(), "a", early_tx);
        tokio::time::advance(Duration::from_secs(10)).await;
        let (late_tx, _late_rx) = oneshot::channel();
        correlator.register("late".to_string(), "b", late_tx);

        assert_eq!(
            correlator.next_deadline(),
            Some(Instant::now() - Duration::from_secs(10) + Duration::from_secs(30))
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(correlator.expire(Instant::now()), 1);
        assert_eq!(
            early_rx.await.unwrap(),
            Err(SessionError::Timeout(TimeoutKind::Request))
        );
        assert!(correlator.contains("late"));

        // A reply after the timeout finds nothing
        assert!(correlator.resolve("early", Ok(Value::Null)).is_none());
    }

    #[tokio::test]
    async fn test_expire_prunes_abandoned_callers() {
        let mut correlator = RequestCorrelator::new(Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        correlator.register("gone".to_string(), "a", tx);
        drop(rx);

        assert_eq!(correlator.expire(Instant::now()), 0);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_entry() {
        let mut correlator = RequestCorrelator::new(Duration::from_secs(30));
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            correlator.register(format!("id-{i}"), "cmd", tx);
            receivers.push(rx);
        }

        let error = SessionError::transport("connection reset");
        assert_eq!(correlator.fail_all(&error), 3);
        assert!(correlator.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(error.clone()));
        }
    }
}
