// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator contracts for the two extraction methods.
//
// The engine never decodes anything itself — the host supplies a barcode
// decoder and an OCR parser behind these traits. Both futures may be dropped
// mid-flight after a timeout or cancellation; a late settlement is discarded,
// never awaited into a second effect, so implementations must tolerate
// abandonment at any await point.

use std::future::Future;

use ausweis_core::types::{ExtractedData, TextObservation};

/// Categorized failure returned by an extraction collaborator.
///
/// `transient` drives both per-attempt retry and fallback eligibility: only
/// transient failures are retried or switched away from in auto mode.
#[derive(Debug, Clone)]
pub struct ExtractorError {
    /// Developer-facing detail, embedded in the wrapping `ScanError`.
    pub detail: String,
    /// Whether another attempt (or the other method) could plausibly succeed.
    pub transient: bool,
}

impl ExtractorError {
    /// A failure worth retrying — no barcode in frame, low OCR confidence.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            transient: true,
        }
    }

    /// A failure no retry will fix — unsupported symbology, corrupt payload.
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for ExtractorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for ExtractorError {}

/// Primary extraction method: decode a raw barcode payload.
pub trait BarcodeDecoder: Send + Sync {
    fn decode(
        &self,
        payload: &str,
    ) -> impl Future<Output = Result<ExtractedData, ExtractorError>> + Send;
}

/// Secondary extraction method: parse OCR text observations.
///
/// When a barcode-first auto session falls back, the observation list may be
/// empty — implementations that need frames are expected to source them from
/// the live camera feed in that case.
pub trait OcrParser: Send + Sync {
    fn parse(
        &self,
        observations: &[TextObservation],
    ) -> impl Future<Output = Result<ExtractedData, ExtractorError>> + Send;
}
