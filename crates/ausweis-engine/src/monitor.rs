// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session performance monitoring.
//
// Wraps a scan session with start/end timestamps, compares against latency
// targets, and raises warning/critical alerts. Purely observational — an
// alert never alters orchestrator control flow.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many alerts the ring buffer retains.
const MAX_RETAINED_ALERTS: usize = 32;

/// Latency targets a healthy session should meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceTargets {
    /// Target ceiling for one secondary-method attempt.
    pub secondary_attempt_ms: u64,
    /// Target ceiling for a full fallback session.
    pub full_session_ms: u64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            secondary_attempt_ms: 2000,
            full_session_ms: 4000,
        }
    }
}

/// Alert severity: over target but under 2× is a warning, 2× or more is
/// critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A latency target violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAlert {
    pub severity: AlertSeverity,
    /// Which target was missed ("secondary-attempt" or "full-session").
    pub metric: &'static str,
    pub observed_ms: u64,
    pub target_ms: u64,
    pub raised_at: DateTime<Utc>,
}

/// Summary returned when a monitored session ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub total_ms: u64,
    pub meets_full_session_target: bool,
    /// Alerts raised by this session's end (empty when on target).
    pub alerts: Vec<PerformanceAlert>,
}

/// Tracks in-flight session start times and a bounded ring of recent alerts.
///
/// Passed to the orchestrator at construction so tests can substitute a
/// monitor with no-op targets.
#[derive(Debug)]
pub struct PerformanceMonitor {
    targets: PerformanceTargets,
    sessions: Mutex<HashMap<Uuid, Instant>>,
    alerts: Mutex<VecDeque<PerformanceAlert>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(PerformanceTargets::default())
    }
}

impl PerformanceMonitor {
    pub fn new(targets: PerformanceTargets) -> Self {
        Self {
            targets,
            sessions: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Begin timing a session. The returned id keys the later `end_session`.
    pub fn start_session(&self) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, Instant::now());
        }
        debug!(session = %id, "performance session started");
        id
    }

    /// Finish timing a session and compare against the full-session target.
    ///
    /// Returns `None` for an unknown id (already ended, or never started).
    pub fn end_session(&self, id: Uuid) -> Option<SessionReport> {
        let started = self.sessions.lock().ok()?.remove(&id)?;
        let total_ms = started.elapsed().as_millis() as u64;

        let mut alerts = Vec::new();
        if let Some(alert) = self.check_target("full-session", total_ms, self.targets.full_session_ms)
        {
            alerts.push(alert);
        }

        debug!(session = %id, total_ms, "performance session ended");
        Some(SessionReport {
            total_ms,
            meets_full_session_target: total_ms < self.targets.full_session_ms,
            alerts,
        })
    }

    /// Record the duration of one secondary-method attempt.
    pub fn record_secondary_attempt(&self, observed_ms: u64) -> Option<PerformanceAlert> {
        self.check_target(
            "secondary-attempt",
            observed_ms,
            self.targets.secondary_attempt_ms,
        )
    }

    /// The most recent alerts, oldest first.
    pub fn recent_alerts(&self) -> Vec<PerformanceAlert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Classify an observation against a target and retain the alert if one
    /// is raised.
    fn check_target(
        &self,
        metric: &'static str,
        observed_ms: u64,
        target_ms: u64,
    ) -> Option<PerformanceAlert> {
        if observed_ms < target_ms {
            return None;
        }

        let severity = if observed_ms >= target_ms.saturating_mul(2) {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = PerformanceAlert {
            severity,
            metric,
            observed_ms,
            target_ms,
            raised_at: Utc::now(),
        };

        warn!(
            metric,
            observed_ms,
            target_ms,
            severity = ?severity,
            "latency target missed"
        );

        if let Ok(mut alerts) = self.alerts.lock() {
            if alerts.len() == MAX_RETAINED_ALERTS {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }
        Some(alert)
    }
}
