// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Ausweis fallback engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which extraction method(s) a scan request is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Pick the first method from the payload shape, fall back if it struggles.
    Auto,
    /// Barcode decoding only — never falls back.
    Primary,
    /// Text recognition only — never falls back.
    Secondary,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        };
        f.write_str(name)
    }
}

/// Lifecycle states of a scan session.
///
/// Superset of [`AutoModeState`]: also covers sessions that are idle, were
/// cancelled, or failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No session in progress.
    Idle,
    /// First method running (barcode decode in a barcode-first session).
    Primary,
    /// First method still running, warning threshold passed.
    Warning,
    /// Fallback decided, settle delay in progress.
    Switching,
    /// Second method running after fallback.
    Secondary,
    /// Session resolved with extracted data.
    Completed,
    /// Session ended by an explicit cancel.
    Cancelled,
    /// Session ended with an error.
    Failed,
}

/// Timeline states of the auto-mode state machine.
///
/// All transitions are forward-only, except [`Success`](Self::Success) which
/// is reachable from any state via an explicit mark-success call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AutoModeState {
    /// Primary method running, no warnings yet.
    InitialPrimary,
    /// Warning threshold elapsed — primary method is taking long.
    Warning,
    /// Switch decided; settle delay running before the secondary activates.
    Switching,
    /// Secondary method is the active one.
    SecondaryActive,
    /// Extraction succeeded (on either method).
    Success,
}

/// Axis-aligned bounding box of a recognised text fragment, in normalized
/// image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One recognised text fragment from the camera's live OCR feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextObservation {
    /// The recognised text content.
    pub text: String,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f32,
    /// Where in the frame the text was found.
    pub bounding_box: BoundingBox,
}

/// Input to a scan request — either a raw barcode payload or a batch of OCR
/// text observations. The payload shape selects the first method tried in
/// auto mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanRequest {
    /// Raw barcode payload (e.g. PDF417 data from the camera's barcode feed).
    Barcode(String),
    /// Text observations from the camera's OCR feed.
    TextObservations(Vec<TextObservation>),
}

impl ScanRequest {
    /// The method this payload is shaped for.
    pub fn preferred_mode(&self) -> ScanMode {
        match self {
            Self::Barcode(_) => ScanMode::Primary,
            Self::TextObservations(_) => ScanMode::Secondary,
        }
    }

    /// Whether this payload can be fed to the given mode at all.
    pub fn matches_mode(&self, mode: ScanMode) -> bool {
        match mode {
            ScanMode::Auto => true,
            ScanMode::Primary => matches!(self, Self::Barcode(_)),
            ScanMode::Secondary => matches!(self, Self::TextObservations(_)),
        }
    }

    /// True when the payload carries no usable data.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Barcode(payload) => payload.trim().is_empty(),
            Self::TextObservations(observations) => observations.is_empty(),
        }
    }
}

/// Structured fields extracted from an identity document.
///
/// The engine treats the contents as opaque — field names and values are
/// whatever the host's decoder or parser produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    /// Named document fields (e.g. "surname", "document-number").
    pub fields: BTreeMap<String, String>,
    /// Raw text the extractor worked from, if it chose to keep it.
    pub raw_text: Option<String>,
}

impl ExtractedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion, mostly for tests and stub extractors.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Immutable progress snapshot emitted to the event sink whenever the session
/// state changes or a decode attempt finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub state: ScanState,
    pub mode: ScanMode,
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub message: String,
}

/// Accumulated timing data for one finished session.
///
/// For sessions that completed normally (success or clean failure) in auto
/// mode, `total_ms` never exceeds the configured budget beyond scheduling
/// jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetrics {
    /// The method that produced the result, or the last one tried on failure.
    pub final_mode: ScanMode,
    /// Wall-clock time spent in the first-method phase.
    pub primary_attempt_ms: u64,
    /// Wall-clock time spent in the fallback phase (0 if never entered).
    pub secondary_attempt_ms: u64,
    /// Whether the session switched methods.
    pub fallback_triggered: bool,
    /// Total session time from request entry to resolution.
    pub total_ms: u64,
    pub success: bool,
}

/// Normalized per-frame quality signals from the camera pipeline.
///
/// All four values are in `[0, 1]`. Only the most recent few samples are
/// retained by the quality evaluator's rolling buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    /// Focus sharpness — 1.0 is perfectly sharp.
    pub sharpness: f32,
    /// Scene illumination — 1.0 is well lit.
    pub illumination: f32,
    /// Specular glare coverage — 0.0 is glare-free.
    pub glare: f32,
    /// Document alignment within the frame — 1.0 is perfectly framed.
    pub alignment: f32,
}

impl QualitySample {
    /// Build a sample with every signal clamped into `[0, 1]`.
    pub fn clamped(sharpness: f32, illumination: f32, glare: f32, alignment: f32) -> Self {
        Self {
            sharpness: sharpness.clamp(0.0, 1.0),
            illumination: illumination.clamp(0.0, 1.0),
            glare: glare.clamp(0.0, 1.0),
            alignment: alignment.clamp(0.0, 1.0),
        }
    }
}
