// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Auto-mode state machine.
//
// Tracks the five-state fallback timeline driven purely by elapsed time and
// the frame-quality signal. It recommends switches over a watch channel and
// the event sink but never calls the extraction collaborators itself, which
// keeps it unit-testable without mocking I/O.
//
// Timer discipline: exactly two timers are live during InitialPrimary
// (warning, timeout) and exactly one during Switching (settle delay). Every
// state exit aborts the timers belonging to the state being left, and
// cancel()/destroy() abort everything.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ausweis_core::config::FallbackConfig;
use ausweis_core::types::{AutoModeState, QualitySample, ScanMode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::events::EventSink;
use crate::quality::QualityEvaluator;

/// Why the machine decided to abandon the primary method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// The primary method ran out of time.
    PrimaryTimeout,
    /// Recent frames were too poor for the primary method to succeed.
    LowQuality,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryTimeout => "primary method timed out",
            Self::LowQuality => "frame quality below threshold",
        }
    }
}

/// Side-effect-free snapshot for UI and accessibility, derived purely from
/// the current state and elapsed time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    pub state: AutoModeState,
    pub elapsed_ms: u64,
    /// Human-readable status line.
    pub message: String,
    /// Accessibility announcement for screen readers.
    pub announcement: String,
}

struct Inner {
    state: AutoModeState,
    started_at: Option<Instant>,
    evaluator: QualityEvaluator,
    switch_reason: Option<SwitchReason>,
    warning_timer: Option<JoinHandle<()>>,
    timeout_timer: Option<JoinHandle<()>>,
    settle_timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn abort_timer(slot: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn abort_all_timers(&mut self) {
        Self::abort_timer(&mut self.warning_timer);
        Self::abort_timer(&mut self.timeout_timer);
        Self::abort_timer(&mut self.settle_timer);
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    config: FallbackConfig,
    sink: EventSink,
    tx: watch::Sender<AutoModeState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Timer tasks never panic while holding the lock; recover anyway.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// InitialPrimary → Warning on warning-threshold expiry.
    fn on_warning_elapsed(self: &Arc<Self>) {
        let elapsed_ms;
        {
            let mut inner = self.lock();
            if inner.state != AutoModeState::InitialPrimary {
                return;
            }
            inner.warning_timer.take();
            inner.state = AutoModeState::Warning;
            elapsed_ms = inner.elapsed().as_millis() as u64;
        }
        debug!(elapsed_ms, "warning threshold reached");
        self.tx.send_replace(AutoModeState::Warning);
        self.sink
            .auto_mode_state_change(AutoModeState::InitialPrimary, AutoModeState::Warning);
        self.sink
            .warning_threshold_reached(elapsed_ms, self.config.warning_threshold_ms);
    }

    /// InitialPrimary/Warning → Switching on primary-timeout expiry.
    fn on_timeout_elapsed(self: &Arc<Self>) {
        self.enter_switching(SwitchReason::PrimaryTimeout);
    }

    /// Switching → SecondaryActive after the settle delay.
    fn on_settle_elapsed(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.state != AutoModeState::Switching {
                return;
            }
            inner.settle_timer.take();
            inner.state = AutoModeState::SecondaryActive;
        }
        info!("secondary method active");
        self.tx.send_replace(AutoModeState::SecondaryActive);
        self.sink
            .auto_mode_state_change(AutoModeState::Switching, AutoModeState::SecondaryActive);
    }

    /// Shared transition into Switching from either pre-switch state. Aborts
    /// the InitialPrimary timers and arms the settle timer.
    fn enter_switching(self: &Arc<Self>, reason: SwitchReason) -> bool {
        let old;
        {
            let mut inner = self.lock();
            if !matches!(
                inner.state,
                AutoModeState::InitialPrimary | AutoModeState::Warning
            ) {
                return false;
            }
            old = inner.state;
            Inner::abort_timer(&mut inner.warning_timer);
            Inner::abort_timer(&mut inner.timeout_timer);
            inner.state = AutoModeState::Switching;
            inner.switch_reason = Some(reason);

            let shared = Arc::clone(self);
            let settle = Duration::from_millis(self.config.switch_delay_ms);
            inner.settle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                shared.on_settle_elapsed();
            }));
        }
        info!(reason = reason.as_str(), from = ?old, "switching extraction method");
        self.tx.send_replace(AutoModeState::Switching);
        self.sink.auto_mode_state_change(old, AutoModeState::Switching);
        self.sink
            .mode_recommendation(ScanMode::Secondary, reason.as_str());
        true
    }
}

/// The auto-mode fallback timeline for one session.
pub struct AutoModeMachine {
    shared: Arc<Shared>,
}

impl AutoModeMachine {
    /// Build a machine for one session. Timers are not armed until
    /// [`start`](Self::start).
    pub fn new(config: &FallbackConfig, sink: EventSink) -> Self {
        let (tx, _) = watch::channel(AutoModeState::InitialPrimary);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: AutoModeState::InitialPrimary,
                    started_at: None,
                    evaluator: QualityEvaluator::new(config.min_quality_score),
                    switch_reason: None,
                    warning_timer: None,
                    timeout_timer: None,
                    settle_timer: None,
                }),
                config: config.clone(),
                sink,
                tx,
            }),
        }
    }

    /// Record the session start and arm the InitialPrimary timers.
    pub fn start(&self) {
        let mut inner = self.shared.lock();
        if inner.started_at.is_some() {
            return;
        }
        inner.started_at = Some(Instant::now());

        let shared = Arc::clone(&self.shared);
        let warning = Duration::from_millis(self.shared.config.warning_threshold_ms);
        inner.warning_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(warning).await;
            shared.on_warning_elapsed();
        }));

        let shared = Arc::clone(&self.shared);
        let timeout = Duration::from_millis(self.shared.config.primary_timeout_ms);
        inner.timeout_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.on_timeout_elapsed();
        }));

        debug!(
            warning_ms = self.shared.config.warning_threshold_ms,
            timeout_ms = self.shared.config.primary_timeout_ms,
            "auto-mode session started"
        );
    }

    /// Feed one frame-quality sample. Returns `true` when this sample tipped
    /// the machine into Switching.
    ///
    /// Quality signals are ignored once the hard session budget is exhausted:
    /// at that point the session is timing out regardless, and a late switch
    /// would outlive its budget.
    pub fn process_quality_sample(&self, sample: QualitySample) -> bool {
        let recommend;
        {
            let mut inner = self.shared.lock();
            if inner.elapsed() >= Duration::from_millis(self.shared.config.max_budget_ms) {
                return false;
            }
            inner.evaluator.record(sample);
            recommend = matches!(
                inner.state,
                AutoModeState::InitialPrimary | AutoModeState::Warning
            ) && inner.evaluator.should_recommend_switch();
        }
        self.shared.sink.quality_assessment(&sample, recommend);
        if recommend {
            self.shared.enter_switching(SwitchReason::LowQuality)
        } else {
            false
        }
    }

    /// Jump to Success from any state (extraction resolved).
    pub fn mark_success(&self) {
        let old;
        {
            let mut inner = self.shared.lock();
            if inner.state == AutoModeState::Success {
                return;
            }
            old = inner.state;
            inner.abort_all_timers();
            inner.state = AutoModeState::Success;
        }
        debug!(from = ?old, "auto-mode session succeeded");
        self.shared.tx.send_replace(AutoModeState::Success);
        self.shared
            .sink
            .auto_mode_state_change(old, AutoModeState::Success);
    }

    /// Abort all timers; the session is being torn down.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        inner.abort_all_timers();
        debug!(state = ?inner.state, "auto-mode timers cancelled");
    }

    /// Idempotent teardown: timers aborted, quality buffer emptied.
    pub fn destroy(&self) {
        let mut inner = self.shared.lock();
        inner.abort_all_timers();
        inner.evaluator.reset();
    }

    pub fn state(&self) -> AutoModeState {
        self.shared.lock().state
    }

    /// Why the machine switched, if it did.
    pub fn switch_reason(&self) -> Option<SwitchReason> {
        self.shared.lock().switch_reason
    }

    /// Watch channel the orchestrator races its decode attempts against.
    pub fn subscribe(&self) -> watch::Receiver<AutoModeState> {
        self.shared.tx.subscribe()
    }

    /// Timers currently armed. Zero after any terminal state or teardown.
    pub fn outstanding_timers(&self) -> usize {
        let inner = self.shared.lock();
        [
            &inner.warning_timer,
            &inner.timeout_timer,
            &inner.settle_timer,
        ]
        .iter()
        .filter(|slot| slot.is_some())
        .count()
    }

    pub fn is_warning_reached(&self) -> bool {
        self.shared.lock().elapsed()
            >= Duration::from_millis(self.shared.config.warning_threshold_ms)
    }

    pub fn is_timeout_reached(&self) -> bool {
        self.shared.lock().elapsed() >= Duration::from_millis(self.shared.config.primary_timeout_ms)
    }

    /// Derive the UI status line and accessibility announcement. No side
    /// effects.
    pub fn progress_info(&self) -> ProgressInfo {
        let inner = self.shared.lock();
        let elapsed_ms = inner.elapsed().as_millis() as u64;
        let (message, announcement) = match inner.state {
            AutoModeState::InitialPrimary => (
                "Scanning barcode…",
                "Scanning. Hold the document steady.",
            ),
            AutoModeState::Warning => (
                "Still scanning — hold steady",
                "Scanning is taking longer than usual. Keep the document in view.",
            ),
            AutoModeState::Switching => (
                "Switching to text recognition…",
                "Switching to text recognition. Turn the document to its text side.",
            ),
            AutoModeState::SecondaryActive => (
                "Reading document text…",
                "Reading the text on the document. Hold steady.",
            ),
            AutoModeState::Success => ("Scan complete", "Scan complete."),
        };
        ProgressInfo {
            state: inner.state,
            elapsed_ms,
            message: message.to_string(),
            announcement: announcement.to_string(),
        }
    }
}

impl Drop for AutoModeMachine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::events::ScanEvents;

    fn test_config() -> FallbackConfig {
        FallbackConfig {
            warning_threshold_ms: 2000,
            primary_timeout_ms: 3000,
            switch_delay_ms: 300,
            max_budget_ms: 8000,
            min_quality_score: 0.4,
            ..Default::default()
        }
    }

    fn bad_frame() -> QualitySample {
        QualitySample::clamped(0.1, 0.2, 0.9, 0.1)
    }

    #[tokio::test(start_paused = true)]
    async fn timeline_walks_warning_switching_secondary() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();
        assert_eq!(machine.state(), AutoModeState::InitialPrimary);
        assert_eq!(machine.outstanding_timers(), 2);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(machine.state(), AutoModeState::Warning);
        assert!(machine.is_warning_reached());
        assert_eq!(machine.outstanding_timers(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(machine.state(), AutoModeState::Switching);
        assert_eq!(machine.switch_reason(), Some(SwitchReason::PrimaryTimeout));
        assert_eq!(machine.outstanding_timers(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(machine.state(), AutoModeState::SecondaryActive);
        assert_eq!(machine.outstanding_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_event_carries_threshold() {
        let reached = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&reached);
        let sink = EventSink::new(ScanEvents {
            on_warning_threshold_reached: Some(Box::new(move |_elapsed, threshold| {
                assert_eq!(threshold, 2000);
                flag.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        let machine = AutoModeMachine::new(&test_config(), sink);
        machine.start();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_bad_frames_switch_before_timeout() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();

        assert!(!machine.process_quality_sample(bad_frame()));
        assert!(!machine.process_quality_sample(bad_frame()));
        assert!(machine.process_quality_sample(bad_frame()));
        assert_eq!(machine.state(), AutoModeState::Switching);
        assert_eq!(machine.switch_reason(), Some(SwitchReason::LowQuality));
        // Warning was skipped; only the settle timer remains.
        assert_eq!(machine.outstanding_timers(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(machine.state(), AutoModeState::SecondaryActive);
        assert_eq!(machine.outstanding_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quality_ignored_in_switching_state() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();
        for _ in 0..3 {
            machine.process_quality_sample(bad_frame());
        }
        assert_eq!(machine.state(), AutoModeState::Switching);
        // Further bad frames no longer tip anything.
        assert!(!machine.process_quality_sample(bad_frame()));
    }

    #[tokio::test(start_paused = true)]
    async fn quality_ignored_once_budget_exhausted() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();
        // Simulate the orchestrator tearing down timers mid-session.
        machine.cancel();

        tokio::time::sleep(Duration::from_millis(9000)).await;
        assert_eq!(machine.state(), AutoModeState::InitialPrimary);
        for _ in 0..5 {
            assert!(!machine.process_quality_sample(bad_frame()));
        }
        assert_eq!(machine.state(), AutoModeState::InitialPrimary);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_success_wins_from_any_state() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(machine.state(), AutoModeState::Warning);

        machine.mark_success();
        assert_eq!(machine.state(), AutoModeState::Success);
        assert_eq!(machine.outstanding_timers(), 0);

        // No stale timer resurrects the timeline.
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(machine.state(), AutoModeState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_clears_every_timer() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();
        assert_eq!(machine.outstanding_timers(), 2);
        machine.cancel();
        assert_eq!(machine.outstanding_timers(), 0);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(machine.state(), AutoModeState::InitialPrimary);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_info_tracks_the_timeline() {
        let machine = AutoModeMachine::new(&test_config(), EventSink::disabled());
        machine.start();
        let info = machine.progress_info();
        assert_eq!(info.state, AutoModeState::InitialPrimary);
        assert!(info.message.contains("barcode"));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let info = machine.progress_info();
        assert_eq!(info.state, AutoModeState::Warning);
        assert_eq!(info.elapsed_ms, 2100);
        assert!(!info.announcement.is_empty());
    }
}
