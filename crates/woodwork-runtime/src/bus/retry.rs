//! Retry bookkeeping with exponential backoff.

use std::time::{Duration, Instant};

use chrono::Utc;
use woodwork_common::config::BusConfig;

use super::event::{DeadLetter, Event};

/// A failed delivery waiting for its next attempt.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    /// The event to redeliver.
    pub event: Event,
    /// Subscriber the delivery failed for.
    pub subscriber: String,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Total attempts allowed.
    pub max_attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Instant,
    /// Time of the first failure.
    pub created_at: Instant,
    /// Error of the last attempt.
    pub last_error: String,
}

impl RetryEntry {
    /// Gives up on this entry, recording `reason`.
    #[must_use]
    pub fn into_dead_letter(self, reason: &str) -> DeadLetter {
        DeadLetter {
            event: self.event,
            subscriber: self.subscriber,
            attempts: self.attempts,
            error: format!("{reason} (last error: {})", self.last_error),
            failed_at: Utc::now(),
        }
    }
}

/// What to do after a failed delivery.
#[derive(Debug)]
pub enum FailureOutcome {
    /// Try again later.
    Retry(RetryEntry),
    /// Give up and record the message.
    DeadLetter(DeadLetter),
}

/// Delay before the attempt following `attempts` failures:
/// `retry_delay * multiplier^(attempts - 1)`, capped at `max_retry_delay`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn backoff_delay(policy: &BusConfig, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
    let cap = policy.max_retry_delay();
    let delay = policy.retry_delay().as_millis() as f64 * policy.backoff_multiplier.powi(exponent);
    if delay.is_nan() || delay >= cap.as_millis() as f64 {
        return cap;
    }
    Duration::from_millis(delay as u64)
}

/// Decides between retry and dead letter after the `attempts`-th failure.
#[must_use]
pub fn after_failure(
    policy: &BusConfig,
    event: Event,
    subscriber: &str,
    attempts: u32,
    error: String,
    first_failure: Option<Instant>,
) -> FailureOutcome {
    if attempts >= policy.max_attempts {
        return FailureOutcome::DeadLetter(DeadLetter {
            event,
            subscriber: subscriber.to_string(),
            attempts,
            error,
            failed_at: Utc::now(),
        });
    }
    let now = Instant::now();
    FailureOutcome::Retry(RetryEntry {
        event,
        subscriber: subscriber.to_string(),
        attempts,
        max_attempts: policy.max_attempts,
        next_attempt_at: now + backoff_delay(policy, attempts),
        created_at: first_failure.unwrap_or(now),
        last_error: error,
    })
}

/// Pending retries.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: Vec<RetryEntry>,
}

impl RetryQueue {
    /// Adds an entry.
    pub fn push(&mut self, entry: RetryEntry) {
        self.entries.push(entry);
    }

    /// Removes and returns the entries due at `now`, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<RetryEntry> {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| e.next_attempt_at <= now);
        self.entries = pending;
        due
    }

    /// Removes and returns entries older than `ttl` or whose subscriber is
    /// gone.
    pub fn purge(&mut self, now: Instant, ttl: Duration, is_live: impl Fn(&str) -> bool) -> Vec<RetryEntry> {
        let (stale, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| now.duration_since(e.created_at) > ttl || !is_live(&e.subscriber));
        self.entries = kept;
        stale
    }

    /// Discards every entry, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
