// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error taxonomy for the Ausweis fallback engine.
//
// Every failure that crosses the engine boundary is one of these variants —
// collaborator errors are always wrapped, never leaked raw. The `recoverable`
// flag decides fallback eligibility: in auto mode only recoverable primary
// failures may trigger a switch to the secondary method.

use thiserror::Error;

/// Top-level error type for all scan operations.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    /// The request payload does not match the requested mode, or is empty.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A scan session is already live on this orchestrator.
    #[error("a scan is already in progress")]
    ConcurrentScan,

    /// The barcode decoder failed.
    #[error("barcode decoding failed: {detail}")]
    PrimaryMethod { detail: String, recoverable: bool },

    /// The text-recognition parser failed.
    #[error("text recognition failed: {detail}")]
    SecondaryMethod { detail: String, recoverable: bool },

    /// No method produced a result within its time budget.
    #[error("detection timed out after {elapsed_ms} ms (budget {budget_ms} ms)")]
    DetectionTimeout { elapsed_ms: u64, budget_ms: u64 },

    /// The session was cancelled by the caller.
    #[error("scan cancelled")]
    Cancelled,

    /// Processing blew past the critical performance threshold.
    #[error("performance critical: {0}")]
    PerformanceCritical(String),

    /// Anything the taxonomy does not cover.
    #[error("unexpected scan failure: {0}")]
    Unknown(String),
}

impl ScanError {
    /// Stable machine-readable code for telemetry and host-side dispatch.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConcurrentScan => "CONCURRENT_SCAN_ERROR",
            Self::PrimaryMethod { .. } => "PRIMARY_METHOD_ERROR",
            Self::SecondaryMethod { .. } => "SECONDARY_METHOD_ERROR",
            Self::DetectionTimeout { .. } => "DETECTION_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::PerformanceCritical(_) => "PERFORMANCE_CRITICAL",
            Self::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// Whether a retry or method switch could plausibly succeed.
    ///
    /// Recoverable errors are fallback-eligible in auto mode; everything else
    /// short-circuits straight to rejection.
    pub fn recoverable(&self) -> bool {
        match self {
            Self::PrimaryMethod { recoverable, .. } => *recoverable,
            Self::SecondaryMethod { recoverable, .. } => *recoverable,
            Self::DetectionTimeout { .. } => true,
            Self::InvalidInput(_)
            | Self::ConcurrentScan
            | Self::Cancelled
            | Self::PerformanceCritical(_)
            | Self::Unknown(_) => false,
        }
    }
}

/// Alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ScanError>;
