// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ausweis — The fallback engine: orchestrator, auto-mode state machine,
// quality evaluation, timers, and performance monitoring.

pub mod auto_mode;
pub mod events;
pub mod extractor;
pub mod monitor;
pub mod orchestrator;
pub mod quality;
pub mod timeout;

pub use auto_mode::{AutoModeMachine, ProgressInfo, SwitchReason};
pub use events::{EventSink, ScanEvents};
pub use extractor::{BarcodeDecoder, ExtractorError, OcrParser};
pub use monitor::{
    AlertSeverity, PerformanceAlert, PerformanceMonitor, PerformanceTargets, SessionReport,
};
pub use orchestrator::ScanOrchestrator;
pub use quality::{QualityEvaluator, assess_quality};
pub use timeout::{TimeoutManager, TimerId, TimerKind};
