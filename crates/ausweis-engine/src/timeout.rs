// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-attempt timeout and retry management.
//
// Owns an explicit set of fire-and-forget timer handles and answers the two
// retry-policy questions: "has this attempt exhausted its budget" and "should
// we retry". Deliberately disjoint from the auto-mode machine's session
// timers — each owner clears only the timers it created.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ausweis_core::config::FallbackConfig;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// What a timer is guarding, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Hard wall-clock ceiling for a whole session.
    Budget,
    /// Per-attempt decode deadline.
    Attempt,
    /// Backoff pause between retries.
    RetryDelay,
}

/// Handle to an outstanding timer, used to clear it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// One entry per outstanding timer. `None` briefly while the task is being
/// spawned; the task itself only fires if its entry is still present.
type TimerTable = Arc<Mutex<HashMap<u64, Option<AbortHandle>>>>;

/// Owns every per-attempt timer for a session and the retry backoff policy.
#[derive(Debug, Default)]
pub struct TimeoutManager {
    timers: TimerTable,
    next_id: AtomicU64,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer. `on_timeout` runs after `after` unless the timer
    /// is cleared first; either way the handle leaves the outstanding set.
    pub fn start_timeout(
        &self,
        kind: TimerKind,
        after: Duration,
        on_timeout: impl FnOnce() + Send + 'static,
    ) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Reserve the slot before spawning so a zero-duration timer cannot
        // fire before it is tracked.
        if let Ok(mut timers) = self.timers.lock() {
            timers.insert(id, None);
        }

        let timers = Arc::clone(&self.timers);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let armed = timers
                .lock()
                .map(|mut table| table.remove(&id).is_some())
                .unwrap_or(false);
            if armed {
                on_timeout();
            }
        });

        if let Ok(mut timers) = self.timers.lock() {
            if let Some(slot) = timers.get_mut(&id) {
                *slot = Some(task.abort_handle());
            }
        }

        trace!(id, kind = ?kind, after_ms = after.as_millis() as u64, "timer armed");
        TimerId(id)
    }

    /// Disarm a timer before it fires. Clearing an already-fired or unknown
    /// timer is a no-op.
    pub fn clear_timeout(&self, id: TimerId) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(Some(handle)) = timers.remove(&id.0) {
                handle.abort();
                trace!(id = id.0, "timer cleared");
            }
        }
    }

    /// Whether the primary phase has exhausted its budget and a switch is in
    /// order.
    pub fn should_trigger_fallback(&self, elapsed: Duration, config: &FallbackConfig) -> bool {
        config.fallback_enabled
            && elapsed >= Duration::from_millis(config.primary_timeout_ms)
    }

    /// Whether another attempt is allowed within the same method.
    pub fn should_retry(&self, attempt: u32, config: &FallbackConfig) -> bool {
        attempt < config.max_attempts
    }

    /// Backoff delay before the next attempt.
    ///
    /// delay = min(base * 2^attempt + jitter, max); jitter is a deterministic
    /// spread in [0, base) so parallel devices don't retry in lockstep.
    pub fn retry_delay(&self, attempt: u32, config: &FallbackConfig) -> Duration {
        let base_ms = config.retry_base_delay_ms.max(1);
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
        let jitter_ms = (attempt as u64).wrapping_mul(6364136223846793005) % base_ms;
        let capped_ms = exp_ms
            .saturating_add(jitter_ms)
            .min(config.retry_max_delay_ms);
        Duration::from_millis(capped_ms)
    }

    /// Number of timers currently armed.
    pub fn outstanding(&self) -> usize {
        self.timers.lock().map(|timers| timers.len()).unwrap_or(0)
    }

    /// Disarm everything unconditionally (session teardown).
    pub fn cleanup(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            let count = timers.len();
            for (_, handle) in timers.drain() {
                if let Some(handle) = handle {
                    handle.abort();
                }
            }
            if count > 0 {
                debug!(count, "cleared all outstanding timers");
            }
        }
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
