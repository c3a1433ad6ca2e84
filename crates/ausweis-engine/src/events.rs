// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Caller-supplied event sink.
//
// A fixed interface of named, individually-optional callbacks. Every dispatch
// runs inside catch_unwind so a misbehaving consumer is logged and can never
// corrupt engine state. Events are emitted in strict chronological order per
// session; only one session is ever live, so streams never interleave.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use ausweis_core::types::{AutoModeState, QualitySample, ScanMetrics, ScanMode, ScanProgress};
use tracing::warn;

use crate::monitor::PerformanceAlert;

/// The caller's callbacks. Every field is optional; unset events are dropped.
#[derive(Default)]
pub struct ScanEvents {
    /// Session state changed or a decode attempt finished.
    pub on_progress_update: Option<Box<dyn Fn(&ScanProgress) + Send + Sync>>,
    pub on_mode_switch: Option<Box<dyn Fn(ScanMode, ScanMode, &str) + Send + Sync>>,
    pub on_metrics_update: Option<Box<dyn Fn(&ScanMetrics) + Send + Sync>>,
    pub on_performance_alert: Option<Box<dyn Fn(&PerformanceAlert) + Send + Sync>>,
    pub on_auto_mode_state_change: Option<Box<dyn Fn(AutoModeState, AutoModeState) + Send + Sync>>,
    pub on_mode_recommendation: Option<Box<dyn Fn(ScanMode, &str) + Send + Sync>>,
    pub on_quality_assessment: Option<Box<dyn Fn(&QualitySample, bool) + Send + Sync>>,
    pub on_warning_threshold_reached: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
}

impl std::fmt::Debug for ScanEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEvents").finish_non_exhaustive()
    }
}

/// Cloneable dispatch handle shared by the orchestrator and the auto-mode
/// machine. `detach()` (called by destroy) drops the callbacks; every later
/// emit becomes a no-op.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    events: Arc<Mutex<Option<Arc<ScanEvents>>>>,
}

impl EventSink {
    pub fn new(events: ScanEvents) -> Self {
        Self {
            events: Arc::new(Mutex::new(Some(Arc::new(events)))),
        }
    }

    /// A sink that never dispatches anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Drop the caller's callbacks. Idempotent.
    pub fn detach(&self) {
        if let Ok(mut events) = self.events.lock() {
            *events = None;
        }
    }

    fn with_events(&self, dispatch: impl FnOnce(&ScanEvents)) {
        let events = match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(events) = events {
            // A panicking consumer must not unwind into the engine.
            if catch_unwind(AssertUnwindSafe(|| dispatch(&events))).is_err() {
                warn!("event sink callback panicked; event dropped");
            }
        }
    }

    pub fn progress_update(&self, progress: &ScanProgress) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_progress_update {
                callback(progress);
            }
        });
    }

    pub fn mode_switch(&self, from: ScanMode, to: ScanMode, reason: &str) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_mode_switch {
                callback(from, to, reason);
            }
        });
    }

    pub fn metrics_update(&self, metrics: &ScanMetrics) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_metrics_update {
                callback(metrics);
            }
        });
    }

    pub fn performance_alert(&self, alert: &PerformanceAlert) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_performance_alert {
                callback(alert);
            }
        });
    }

    pub fn auto_mode_state_change(&self, old: AutoModeState, new: AutoModeState) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_auto_mode_state_change {
                callback(old, new);
            }
        });
    }

    pub fn mode_recommendation(&self, mode: ScanMode, reason: &str) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_mode_recommendation {
                callback(mode, reason);
            }
        });
    }

    pub fn quality_assessment(&self, sample: &QualitySample, should_switch: bool) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_quality_assessment {
                callback(sample, should_switch);
            }
        });
    }

    pub fn warning_threshold_reached(&self, elapsed_ms: u64, threshold_ms: u64) {
        self.with_events(|events| {
            if let Some(callback) = &events.on_warning_threshold_reached {
                callback(elapsed_ms, threshold_ms);
            }
        });
    }
}
