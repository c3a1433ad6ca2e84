// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The scan orchestrator — single entry point of the fallback engine.
//
// Runs one extraction method under a timeout race, decides whether to fall
// back to the other method, and resolves exactly one result or error per
// request. At most one session is live per instance; a concurrent scan is
// rejected, never queued. Every exit path (success, failure, cancel, destroy)
// runs the same teardown, so no timers or half-aborted work survive a
// session.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ausweis_core::config::{FallbackConfig, FallbackConfigUpdate};
use ausweis_core::error::ScanError;
use ausweis_core::types::{
    AutoModeState, ExtractedData, QualitySample, ScanMetrics, ScanMode, ScanProgress, ScanRequest,
    ScanState, TextObservation,
};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auto_mode::AutoModeMachine;
use crate::events::{EventSink, ScanEvents};
use crate::extractor::{BarcodeDecoder, ExtractorError, OcrParser};
use crate::monitor::PerformanceMonitor;
use crate::timeout::{TimeoutManager, TimerKind};

/// Per-request mutable state, owned exclusively by the orchestrator.
struct SessionShared {
    token: CancellationToken,
    /// Present only for auto-mode, barcode-first sessions with fallback on.
    machine: Option<Arc<AutoModeMachine>>,
    started_at: Instant,
    state: Mutex<ScanState>,
    mode: ScanMode,
    attempt: AtomicU32,
}

impl SessionShared {
    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// How one method phase ended.
enum PhaseEnd {
    Success(ExtractedData),
    Failed(ExtractorError),
    /// The collaborator panicked; caught at the attempt boundary, never
    /// unwound through the engine.
    Panicked(String),
    /// The phase's own deadline expired.
    PhaseTimeout,
    /// The hard session budget expired.
    BudgetExhausted,
    /// The auto-mode machine recommended switching methods.
    SwitchRequested,
    Cancelled,
}

/// Resolution of a whole session, fed into metrics.
struct SessionOutcome {
    result: Result<ExtractedData, ScanError>,
    final_mode: ScanMode,
    primary_ms: u64,
    secondary_ms: u64,
    fallback_triggered: bool,
}

/// Session teardown as an RAII guard: runs when `scan` returns, unwinds, or
/// has its future dropped mid-flight. Destroys the machine, empties the timer
/// registry, closes the monitor session, and frees the session slot.
struct SessionGuard<'a> {
    session: Arc<SessionShared>,
    slot: &'a Mutex<Option<Arc<SessionShared>>>,
    timeouts: &'a TimeoutManager,
    monitor: &'a PerformanceMonitor,
    perf_id: Uuid,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(machine) = &self.session.machine {
            machine.destroy();
        }
        self.timeouts.cleanup();
        self.monitor.end_session(self.perf_id);
        *relock(self.slot) = None;
    }
}

/// Orchestrates one extraction request at a time over two collaborator-backed
/// methods.
///
/// The decoder and parser are opaque async capabilities supplied by the host;
/// the monitor is injected so tests can substitute one with no-op targets.
pub struct ScanOrchestrator<P, S> {
    decoder: P,
    parser: S,
    config: Mutex<FallbackConfig>,
    events: EventSink,
    monitor: Arc<PerformanceMonitor>,
    timeouts: TimeoutManager,
    session: Mutex<Option<Arc<SessionShared>>>,
    destroyed: AtomicBool,
}

fn relock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<P: BarcodeDecoder, S: OcrParser> ScanOrchestrator<P, S> {
    /// Build an orchestrator with an explicit config, event sink, and monitor.
    pub fn new(
        decoder: P,
        parser: S,
        config: FallbackConfig,
        events: ScanEvents,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        Ok(Self {
            decoder,
            parser,
            config: Mutex::new(config),
            events: EventSink::new(events),
            monitor,
            timeouts: TimeoutManager::new(),
            session: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Default config, no event callbacks, default latency targets.
    pub fn with_defaults(decoder: P, parser: S) -> Self {
        Self {
            decoder,
            parser,
            config: Mutex::new(FallbackConfig::default()),
            events: EventSink::disabled(),
            monitor: Arc::new(PerformanceMonitor::default()),
            timeouts: TimeoutManager::new(),
            session: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Run one extraction request to a single resolution.
    ///
    /// Exactly one of `Ok(data)` or `Err(scan_error)` per call; the caller's
    /// future is never left unsettled, including across `cancel()`.
    #[instrument(skip_all, fields(mode = %mode))]
    pub async fn scan(
        &self,
        request: ScanRequest,
        mode: ScanMode,
    ) -> Result<ExtractedData, ScanError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ScanError::Unknown("orchestrator has been destroyed".into()));
        }

        // Input validation happens before any session state is touched.
        if request.is_empty() {
            return Err(ScanError::InvalidInput("empty scan payload".into()));
        }
        if !request.matches_mode(mode) {
            return Err(ScanError::InvalidInput(format!(
                "payload shape does not match requested mode '{mode}'"
            )));
        }

        let config = relock(&self.config).clone();

        // Single flight: claim the session slot or fail fast.
        let session = {
            let mut slot = relock(&self.session);
            if slot.is_some() {
                warn!("scan rejected: a session is already live");
                return Err(ScanError::ConcurrentScan);
            }
            let first = request.preferred_mode();
            let machine = (mode == ScanMode::Auto
                && first == ScanMode::Primary
                && config.fallback_enabled)
                .then(|| Arc::new(AutoModeMachine::new(&config, self.events.clone())));
            let session = Arc::new(SessionShared {
                token: CancellationToken::new(),
                machine,
                started_at: Instant::now(),
                state: Mutex::new(match first {
                    ScanMode::Secondary => ScanState::Secondary,
                    _ => ScanState::Primary,
                }),
                mode,
                attempt: AtomicU32::new(0),
            });
            *slot = Some(Arc::clone(&session));
            session
        };

        let perf_id = self.monitor.start_session();

        // Holds the teardown; fires even if this future is dropped mid-flight.
        let guard = SessionGuard {
            session: Arc::clone(&session),
            slot: &self.session,
            timeouts: &self.timeouts,
            monitor: self.monitor.as_ref(),
            perf_id,
        };

        // Hard wall-clock ceiling for the whole session, fallback included.
        let budget_token = CancellationToken::new();
        {
            let token = budget_token.clone();
            self.timeouts.start_timeout(
                TimerKind::Budget,
                Duration::from_millis(config.max_budget_ms),
                move || token.cancel(),
            );
        }

        if let Some(machine) = &session.machine {
            machine.start();
        }
        info!(budget_ms = config.max_budget_ms, "scan session started");
        self.emit_progress(&session, "scan started");

        let outcome = self
            .run_session(&request, &config, &session, &budget_token)
            .await;

        if let Some(machine) = &session.machine {
            if outcome.result.is_ok() {
                machine.mark_success();
            }
        }

        let final_state = match &outcome.result {
            Ok(_) => ScanState::Completed,
            Err(ScanError::Cancelled) => ScanState::Cancelled,
            Err(_) => ScanState::Failed,
        };
        *relock(&session.state) = final_state;
        self.emit_progress(
            &session,
            match final_state {
                ScanState::Completed => "scan completed",
                ScanState::Cancelled => "scan cancelled",
                _ => "scan failed",
            },
        );

        let metrics = ScanMetrics {
            final_mode: outcome.final_mode,
            primary_attempt_ms: outcome.primary_ms,
            secondary_attempt_ms: outcome.secondary_ms,
            fallback_triggered: outcome.fallback_triggered,
            total_ms: session.elapsed_ms(),
            success: outcome.result.is_ok(),
        };
        self.events.metrics_update(&metrics);

        if let Some(report) = self.monitor.end_session(perf_id) {
            for alert in &report.alerts {
                self.events.performance_alert(alert);
            }
        }

        // Destroys the machine, clears all timers, frees the session slot.
        drop(guard);
        debug!(success = metrics.success, total_ms = metrics.total_ms, "session resolved");
        outcome.result
    }

    /// Cancel the live session, if any. The call that initiated the scan
    /// settles with `ScanError::Cancelled` and runs the shared teardown.
    pub fn cancel(&self) {
        let session = relock(&self.session).clone();
        if let Some(session) = session {
            info!("cancelling live scan session");
            session.token.cancel();
        }
    }

    /// Idempotent teardown of the whole orchestrator: cancels any live
    /// session, clears all timers, and drops the event sink reference.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.cancel();
        self.timeouts.cleanup();
        self.events.detach();
    }

    /// Merge a partial config update. Validated as a whole; takes effect on
    /// the next session only.
    pub fn update_config(&self, update: FallbackConfigUpdate) -> Result<(), ScanError> {
        let mut config = relock(&self.config);
        let mut merged = config.clone();
        update.apply(&mut merged);
        merged.validate()?;
        *config = merged;
        info!("configuration updated; applies from the next session");
        Ok(())
    }

    /// Current session state, `Idle` when nothing is live.
    pub fn state(&self) -> ScanState {
        match relock(&self.session).as_ref() {
            Some(session) => self.effective_state(session),
            None => ScanState::Idle,
        }
    }

    /// Mode of the live session, `None` when idle.
    pub fn mode(&self) -> Option<ScanMode> {
        relock(&self.session).as_ref().map(|session| session.mode)
    }

    /// Forward a camera-frame quality sample to the live auto-mode session.
    /// Returns `true` when the sample tipped the machine into switching.
    /// No-op outside an auto-mode, barcode-first session.
    pub fn process_quality_sample(&self, sample: QualitySample) -> bool {
        let machine = relock(&self.session)
            .as_ref()
            .and_then(|session| session.machine.clone());
        match machine {
            Some(machine) => machine.process_quality_sample(sample),
            None => false,
        }
    }

    /// Timers currently armed across the whole engine (session watchdog plus
    /// auto-mode machine). Zero whenever no session is live.
    pub fn outstanding_timers(&self) -> usize {
        let machine_timers = relock(&self.session)
            .as_ref()
            .and_then(|session| session.machine.as_ref().map(|m| m.outstanding_timers()))
            .unwrap_or(0);
        self.timeouts.outstanding() + machine_timers
    }

    // -----------------------------------------------------------------------
    // Session internals
    // -----------------------------------------------------------------------

    async fn run_session(
        &self,
        request: &ScanRequest,
        config: &FallbackConfig,
        session: &SessionShared,
        budget_token: &CancellationToken,
    ) -> SessionOutcome {
        match request {
            ScanRequest::Barcode(payload) => {
                self.run_barcode_first(payload, config, session, budget_token)
                    .await
            }
            ScanRequest::TextObservations(observations) => {
                self.run_ocr_only(observations, config, session, budget_token)
                    .await
            }
        }
    }

    /// Barcode-first session: primary phase with bounded retries, then — in
    /// auto mode with budget to spare — one fallback attempt on the parser.
    async fn run_barcode_first(
        &self,
        payload: &str,
        config: &FallbackConfig,
        session: &SessionShared,
        budget_token: &CancellationToken,
    ) -> SessionOutcome {
        let phase_started = Instant::now();
        let deadline = phase_started + Duration::from_millis(config.primary_timeout_ms);
        let switch_rx = session.machine.as_ref().map(|machine| machine.subscribe());

        let phase_end = self
            .attempt_loop(
                session,
                config,
                budget_token,
                deadline,
                switch_rx,
                "barcode decode",
                || self.decoder.decode(payload),
            )
            .await;
        let primary_ms = phase_started.elapsed().as_millis() as u64;

        let primary_error = match phase_end {
            PhaseEnd::Success(data) => {
                return SessionOutcome {
                    result: Ok(data),
                    final_mode: ScanMode::Primary,
                    primary_ms,
                    secondary_ms: 0,
                    fallback_triggered: false,
                };
            }
            PhaseEnd::Cancelled => {
                return SessionOutcome {
                    result: Err(ScanError::Cancelled),
                    final_mode: ScanMode::Primary,
                    primary_ms,
                    secondary_ms: 0,
                    fallback_triggered: false,
                };
            }
            PhaseEnd::BudgetExhausted => ScanError::DetectionTimeout {
                elapsed_ms: session.elapsed_ms(),
                budget_ms: config.max_budget_ms,
            },
            PhaseEnd::PhaseTimeout => ScanError::DetectionTimeout {
                elapsed_ms: session.elapsed_ms(),
                budget_ms: config.primary_timeout_ms,
            },
            PhaseEnd::SwitchRequested => ScanError::PrimaryMethod {
                detail: "primary method abandoned on switch recommendation".into(),
                recoverable: true,
            },
            PhaseEnd::Failed(err) => ScanError::PrimaryMethod {
                detail: err.detail,
                recoverable: err.transient,
            },
            // A panicking collaborator is never fallback-eligible.
            PhaseEnd::Panicked(detail) => {
                ScanError::Unknown(format!("barcode decoder panicked: {detail}"))
            }
        };

        // Fallback decision. Non-recoverable errors skip fallback even in
        // auto mode; so does an exhausted or nearly-exhausted budget.
        let remaining = Duration::from_millis(config.max_budget_ms)
            .saturating_sub(session.started_at.elapsed());
        let eligible = session.mode == ScanMode::Auto
            && config.fallback_enabled
            && primary_error.recoverable()
            && !budget_token.is_cancelled()
            && remaining >= Duration::from_millis(config.min_secondary_budget_ms);

        if !eligible {
            debug!(
                error = %primary_error,
                remaining_ms = remaining.as_millis() as u64,
                "fallback not eligible; rejecting with primary error"
            );
            return SessionOutcome {
                result: Err(primary_error),
                final_mode: ScanMode::Primary,
                primary_ms,
                secondary_ms: 0,
                fallback_triggered: false,
            };
        }

        let reason = session
            .machine
            .as_ref()
            .and_then(|machine| machine.switch_reason())
            .map(|reason| reason.as_str())
            .unwrap_or("primary method failed");
        info!(reason, remaining_ms = remaining.as_millis() as u64, "falling back to secondary method");
        *relock(&session.state) = ScanState::Switching;
        self.events
            .mode_switch(ScanMode::Primary, ScanMode::Secondary, reason);
        self.emit_progress(session, "switching to text recognition");

        // Settle delay: deliberate pause so the host UI doesn't thrash.
        tokio::select! {
            biased;
            _ = session.token.cancelled() => {
                return SessionOutcome {
                    result: Err(ScanError::Cancelled),
                    final_mode: ScanMode::Secondary,
                    primary_ms,
                    secondary_ms: 0,
                    fallback_triggered: true,
                };
            }
            _ = tokio::time::sleep(Duration::from_millis(config.switch_delay_ms)) => {}
        }

        *relock(&session.state) = ScanState::Secondary;
        self.emit_progress(session, "text recognition started");

        // The secondary attempt gets the smaller of its nominal timeout and
        // whatever is left of the session budget.
        let remaining = Duration::from_millis(config.max_budget_ms)
            .saturating_sub(session.started_at.elapsed());
        let secondary_budget =
            remaining.min(Duration::from_millis(config.secondary_timeout_ms));
        let secondary_started = Instant::now();
        session.attempt.fetch_add(1, Ordering::SeqCst);

        let phase_token = CancellationToken::new();
        let phase_timer = {
            let token = phase_token.clone();
            self.timeouts
                .start_timeout(TimerKind::Attempt, secondary_budget, move || token.cancel())
        };
        let attempt_end: PhaseEnd = tokio::select! {
            biased;
            _ = session.token.cancelled() => PhaseEnd::Cancelled,
            _ = budget_token.cancelled() => PhaseEnd::BudgetExhausted,
            _ = phase_token.cancelled() => PhaseEnd::PhaseTimeout,
            result = AssertUnwindSafe(self.parser.parse(&[])).catch_unwind() => match result {
                Ok(Ok(data)) => PhaseEnd::Success(data),
                Ok(Err(err)) => PhaseEnd::Failed(err),
                Err(payload) => PhaseEnd::Panicked(panic_detail(payload)),
            }
        };
        self.timeouts.clear_timeout(phase_timer);
        let secondary_ms = secondary_started.elapsed().as_millis() as u64;

        if let Some(alert) = self.monitor.record_secondary_attempt(secondary_ms) {
            self.events.performance_alert(&alert);
        }

        let result = match attempt_end {
            PhaseEnd::Success(data) => Ok(data),
            PhaseEnd::Cancelled => Err(ScanError::Cancelled),
            PhaseEnd::Failed(err) => Err(ScanError::SecondaryMethod {
                detail: err.detail,
                recoverable: err.transient,
            }),
            PhaseEnd::PhaseTimeout | PhaseEnd::BudgetExhausted => {
                Err(ScanError::DetectionTimeout {
                    elapsed_ms: session.elapsed_ms(),
                    budget_ms: config.max_budget_ms,
                })
            }
            PhaseEnd::Panicked(detail) => Err(ScanError::Unknown(format!(
                "text parser panicked: {detail}"
            ))),
            // No machine is consulted during the secondary phase.
            PhaseEnd::SwitchRequested => Err(ScanError::Unknown(
                "switch requested during secondary phase".into(),
            )),
        };

        SessionOutcome {
            result,
            final_mode: ScanMode::Secondary,
            primary_ms,
            secondary_ms,
            fallback_triggered: true,
        }
    }

    /// Observation-payload session (secondary-only, or auto with an OCR
    /// payload). There is no switch direction away from the secondary method,
    /// so this phase never falls back.
    async fn run_ocr_only(
        &self,
        observations: &[TextObservation],
        config: &FallbackConfig,
        session: &SessionShared,
        budget_token: &CancellationToken,
    ) -> SessionOutcome {
        let phase_started = Instant::now();
        let deadline = phase_started + Duration::from_millis(config.secondary_timeout_ms);

        let phase_end = self
            .attempt_loop(
                session,
                config,
                budget_token,
                deadline,
                None,
                "text recognition",
                || self.parser.parse(observations),
            )
            .await;
        let secondary_ms = phase_started.elapsed().as_millis() as u64;

        if let Some(alert) = self.monitor.record_secondary_attempt(secondary_ms) {
            self.events.performance_alert(&alert);
        }

        let result = match phase_end {
            PhaseEnd::Success(data) => Ok(data),
            PhaseEnd::Cancelled => Err(ScanError::Cancelled),
            PhaseEnd::Failed(err) => Err(ScanError::SecondaryMethod {
                detail: err.detail,
                recoverable: err.transient,
            }),
            PhaseEnd::PhaseTimeout | PhaseEnd::BudgetExhausted => {
                Err(ScanError::DetectionTimeout {
                    elapsed_ms: session.elapsed_ms(),
                    budget_ms: config.max_budget_ms,
                })
            }
            PhaseEnd::Panicked(detail) => Err(ScanError::Unknown(format!(
                "text parser panicked: {detail}"
            ))),
            PhaseEnd::SwitchRequested => {
                Err(ScanError::Unknown("switch requested without a machine".into()))
            }
        };

        SessionOutcome {
            result,
            final_mode: ScanMode::Secondary,
            primary_ms: 0,
            secondary_ms,
            fallback_triggered: false,
        }
    }

    /// Run one method with bounded in-method retries, racing every attempt
    /// against cancellation, the session budget, the phase deadline, and (if
    /// a machine is attached) the switch recommendation.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop<F, Fut>(
        &self,
        session: &SessionShared,
        config: &FallbackConfig,
        budget_token: &CancellationToken,
        deadline: Instant,
        mut switch_rx: Option<watch::Receiver<AutoModeState>>,
        label: &str,
        mut run_attempt: F,
    ) -> PhaseEnd
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ExtractedData, ExtractorError>>,
    {
        // Phase deadline is a tracked timer so cleanup() covers it too.
        let phase_token = CancellationToken::new();
        let phase_timer = {
            let token = phase_token.clone();
            self.timeouts.start_timeout(
                TimerKind::Attempt,
                deadline.saturating_duration_since(Instant::now()),
                move || token.cancel(),
            )
        };

        let end = loop {
            let attempt = session.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            self.emit_progress(session, &format!("{label} attempt {attempt}"));

            let end = tokio::select! {
                biased;
                _ = session.token.cancelled() => PhaseEnd::Cancelled,
                _ = budget_token.cancelled() => PhaseEnd::BudgetExhausted,
                _ = wait_for_switch(&mut switch_rx) => PhaseEnd::SwitchRequested,
                _ = phase_token.cancelled() => PhaseEnd::PhaseTimeout,
                result = AssertUnwindSafe(run_attempt()).catch_unwind() => match result {
                    Ok(Ok(data)) => PhaseEnd::Success(data),
                    Ok(Err(err)) => PhaseEnd::Failed(err),
                    Err(payload) => PhaseEnd::Panicked(panic_detail(payload)),
                }
            };

            match end {
                PhaseEnd::Failed(err)
                    if err.transient
                        && self.timeouts.should_retry(attempt, config)
                        && Instant::now() < deadline =>
                {
                    let delay = self.timeouts.retry_delay(attempt, config);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{label} failed; retrying"
                    );
                    let retry_token = CancellationToken::new();
                    let retry_timer = {
                        let token = retry_token.clone();
                        self.timeouts
                            .start_timeout(TimerKind::RetryDelay, delay, move || token.cancel())
                    };
                    tokio::select! {
                        biased;
                        _ = session.token.cancelled() => {
                            self.timeouts.clear_timeout(retry_timer);
                            break PhaseEnd::Cancelled;
                        }
                        _ = retry_token.cancelled() => {}
                    }
                }
                other => break other,
            }
        };
        self.timeouts.clear_timeout(phase_timer);
        end
    }

    /// Session state as seen from outside, folding in the machine's warning
    /// stage.
    fn effective_state(&self, session: &SessionShared) -> ScanState {
        let base = *relock(&session.state);
        if base == ScanState::Primary {
            if let Some(machine) = &session.machine {
                if machine.state() == AutoModeState::Warning {
                    return ScanState::Warning;
                }
            }
        }
        base
    }

    fn emit_progress(&self, session: &SessionShared, message: &str) {
        let progress = ScanProgress {
            state: self.effective_state(session),
            mode: session.mode,
            attempt: session.attempt.load(Ordering::SeqCst),
            elapsed_ms: session.elapsed_ms(),
            message: message.to_string(),
        };
        self.events.progress_update(&progress);
    }
}

/// Resolve when the machine recommends a switch; pend forever without one.
async fn wait_for_switch(rx: &mut Option<watch::Receiver<AutoModeState>>) {
    match rx {
        Some(rx) => {
            // Fold to a bool immediately: the Ok value holds the channel's
            // read guard, which must not live across the pending await.
            let switched = rx
                .wait_for(|state| {
                    matches!(
                        state,
                        AutoModeState::Switching | AutoModeState::SecondaryActive
                    )
                })
                .await
                .is_ok();
            if !switched {
                // Machine dropped without switching — nothing to wait for.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Best-effort text from a caught panic payload.
fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(detail) = payload.downcast_ref::<&str>() {
        (*detail).to_string()
    } else if let Some(detail) = payload.downcast_ref::<String>() {
        detail.clone()
    } else {
        "opaque panic payload".into()
    }
}
