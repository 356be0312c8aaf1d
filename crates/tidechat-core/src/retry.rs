//! Offline queue scheduling and backoff policy
//!
//! Failed-but-retryable sends wait in a per-conversation FIFO queue and are
//! redriven with exponential backoff. Jitter is derived deterministically
//! from the correlation id and attempt number so redrive bursts after a
//! reconnect spread out without threading an RNG through the engine.

use core::time::Duration;
use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::config::RetryConfig;
use crate::types::{CorrelationId, Timestamp};

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Compute the delay before retry attempt `attempt` (1-based)
///
/// Exponential growth from `initial_backoff`, capped at `max_backoff`, with
/// deterministic per-message jitter of ±`jitter_ratio`.
pub fn backoff_delay(config: &RetryConfig, correlation_id: &CorrelationId, attempt: u32) -> Duration {
    let base = config.initial_backoff.as_millis() as f64;
    let exponent = attempt.saturating_sub(1) as i32;
    let scaled = base * f64::from(config.backoff_multiplier).powi(exponent);
    let capped = scaled.min(config.max_backoff.as_millis() as f64);

    // Map a hash of (correlation id, attempt) onto [-jitter, +jitter]
    let mut hasher = Sha256::new();
    hasher.update(correlation_id.as_uuid().as_bytes());
    hasher.update(attempt.to_be_bytes());
    let digest = hasher.finalize();
    let raw = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let unit = (raw as f64 / u64::MAX as f64) * 2.0 - 1.0;
    let jittered = capped * (1.0 + unit * f64::from(config.jitter_ratio));

    Duration::from_millis(jittered.max(0.0) as u64)
}

// ----------------------------------------------------------------------------
// Queued Send
// ----------------------------------------------------------------------------

/// A send awaiting (re)dispatch
#[derive(Debug, Clone)]
pub struct QueuedSend {
    pub correlation_id: CorrelationId,
    /// Dispatch attempts made so far
    pub attempts: u32,
    /// Earliest time the next attempt may run
    pub not_before: Timestamp,
}

impl QueuedSend {
    /// Queue a send for immediate dispatch
    pub fn immediate(correlation_id: CorrelationId, now: Timestamp) -> Self {
        Self {
            correlation_id,
            attempts: 0,
            not_before: now,
        }
    }
}

// ----------------------------------------------------------------------------
// Send Queue
// ----------------------------------------------------------------------------

/// Per-conversation FIFO of sends awaiting dispatch
///
/// FIFO order preserves the sender-perceived order within the conversation;
/// there is no ordering guarantee across conversations. The queue is
/// rebuilt from the durable store on startup, so it survives restarts.
#[derive(Debug, Default)]
pub struct SendQueue {
    entries: VecDeque<QueuedSend>,
}

impl SendQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a send to the back of the queue
    pub fn push(&mut self, entry: QueuedSend) {
        self.entries.push_back(entry);
    }

    /// The send to dispatch next, if its backoff deadline has passed
    ///
    /// Head-of-line only: a later message never overtakes an earlier one
    /// in the same conversation.
    pub fn pop_ready(&mut self, now: Timestamp) -> Option<QueuedSend> {
        match self.entries.front() {
            Some(head) if head.not_before <= now => self.entries.pop_front(),
            _ => None,
        }
    }

    /// Requeue a send at the front after a transient failure
    pub fn requeue_front(&mut self, entry: QueuedSend) {
        self.entries.push_front(entry);
    }

    /// Remove a send wherever it sits (terminal failure or confirmation
    /// arriving through the listener before the redrive ran)
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.correlation_id != *correlation_id);
        before != self.entries.len()
    }

    /// Clear all backoff deadlines so the next dispatch runs immediately
    /// (connectivity regained, app foregrounded, manual retry)
    pub fn release_all(&mut self, now: Timestamp) {
        for entry in &mut self.entries {
            entry.not_before = now;
        }
    }

    /// Deadline of the head entry, used to arm the redrive timer
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.entries.front().map(|e| e.not_before)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.entries
            .iter()
            .any(|e| e.correlation_id == *correlation_id)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter_ratio: 0.0,
            ..RetryConfig::default()
        };
        let id = CorrelationId::generate();

        let d1 = backoff_delay(&config, &id, 1);
        let d2 = backoff_delay(&config, &id, 2);
        let d3 = backoff_delay(&config, &id, 3);
        assert_eq!(d1, config.initial_backoff);
        assert_eq!(d2, config.initial_backoff * 2);
        assert_eq!(d3, config.initial_backoff * 4);

        let capped = backoff_delay(&config, &id, 30);
        assert_eq!(capped, config.max_backoff);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let config = RetryConfig::default();
        let base = config.initial_backoff.as_millis() as f64;
        for _ in 0..50 {
            let id = CorrelationId::generate();
            let delay = backoff_delay(&config, &id, 1).as_millis() as f64;
            assert!(delay >= base * (1.0 - f64::from(config.jitter_ratio)) - 1.0);
            assert!(delay <= base * (1.0 + f64::from(config.jitter_ratio)) + 1.0);
        }
    }

    #[test]
    fn test_jitter_is_deterministic_per_message() {
        let config = RetryConfig::default();
        let id = CorrelationId::generate();
        assert_eq!(backoff_delay(&config, &id, 2), backoff_delay(&config, &id, 2));
    }

    #[test]
    fn test_queue_is_fifo_and_head_gated() {
        let mut queue = SendQueue::new();
        let first = CorrelationId::generate();
        let second = CorrelationId::generate();

        queue.push(QueuedSend {
            correlation_id: first,
            attempts: 1,
            not_before: Timestamp::new(1_000),
        });
        queue.push(QueuedSend {
            correlation_id: second,
            attempts: 0,
            not_before: Timestamp::new(0),
        });

        // Second is ready but never overtakes the head
        assert!(queue.pop_ready(Timestamp::new(500)).is_none());

        let popped = queue.pop_ready(Timestamp::new(1_000)).unwrap();
        assert_eq!(popped.correlation_id, first);
        let popped = queue.pop_ready(Timestamp::new(1_000)).unwrap();
        assert_eq!(popped.correlation_id, second);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_release_all_clears_deadlines() {
        let mut queue = SendQueue::new();
        let id = CorrelationId::generate();
        queue.push(QueuedSend {
            correlation_id: id,
            attempts: 2,
            not_before: Timestamp::new(10_000),
        });

        assert!(queue.pop_ready(Timestamp::new(0)).is_none());
        queue.release_all(Timestamp::new(0));
        assert!(queue.pop_ready(Timestamp::new(0)).is_some());
    }

    #[test]
    fn test_remove_unqueues_anywhere() {
        let mut queue = SendQueue::new();
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        queue.push(QueuedSend::immediate(a, Timestamp::new(0)));
        queue.push(QueuedSend::immediate(b, Timestamp::new(0)));

        assert!(queue.remove(&b));
        assert!(!queue.remove(&b));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&a));
    }
}
