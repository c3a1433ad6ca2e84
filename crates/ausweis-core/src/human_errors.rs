// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for scan failures.
//
// Every engine error is mapped to plain English with a clear suggestion.
// Rendering is entirely the host's responsibility — the engine only supplies
// the message, suggestion, and severity.

use crate::error::ScanError;

/// Severity of an error from the user's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// A retry (possibly with the other method) may well succeed.
    Transient,
    /// The user must do something — better lighting, steadier hands.
    ActionRequired,
    /// Cannot be fixed by retrying — bad request, unsupported document.
    Permanent,
}

/// A human-readable error with plain English message and actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// Plain English summary (shown as a heading).
    pub message: String,
    /// What the user should try (shown as body text).
    pub suggestion: String,
    /// Whether the system should auto-retry.
    pub retriable: bool,
    /// Severity level (drives icon/colour in UI).
    pub severity: Severity,
}

/// Convert a `ScanError` into a `HumanError` that a grandparent can understand.
pub fn humanize_error(err: &ScanError) -> HumanError {
    match err {
        ScanError::InvalidInput(detail) => HumanError {
            message: "We couldn't start the scan.".into(),
            suggestion: format!("Something about the request wasn't right. ({detail})"),
            retriable: false,
            severity: Severity::Permanent,
        },

        ScanError::ConcurrentScan => HumanError {
            message: "A scan is already running.".into(),
            suggestion: "Wait for the current scan to finish, or cancel it first.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        ScanError::PrimaryMethod { recoverable, .. } => {
            if *recoverable {
                HumanError {
                    message: "We couldn't read the barcode.".into(),
                    suggestion: "Hold the document flat and steady, and make sure the barcode isn't covered by glare.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            } else {
                HumanError {
                    message: "This barcode can't be read.".into(),
                    suggestion: "The barcode may be damaged or of an unsupported type. Try scanning the text side of the document instead.".into(),
                    retriable: false,
                    severity: Severity::Permanent,
                }
            }
        }

        ScanError::SecondaryMethod { recoverable, .. } => {
            if *recoverable {
                HumanError {
                    message: "Text recognition didn't work on this scan.".into(),
                    suggestion: "Try again with better lighting, making sure the text is clear and in focus.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            } else {
                HumanError {
                    message: "We couldn't read the text on this document.".into(),
                    suggestion: "The document may be damaged or unsupported. Try entering the details manually.".into(),
                    retriable: false,
                    severity: Severity::Permanent,
                }
            }
        }

        ScanError::DetectionTimeout { .. } => HumanError {
            message: "The scan is taking too long.".into(),
            suggestion: "Move to a brighter spot, hold the camera closer to the document, and try again.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        ScanError::Cancelled => HumanError {
            message: "The scan was cancelled.".into(),
            suggestion: "Tap scan to start again whenever you're ready.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        ScanError::PerformanceCritical(_) => HumanError {
            message: "Scanning is running very slowly on this device.".into(),
            suggestion: "Close other apps and try again. If this keeps happening, try entering the details manually.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        ScanError::Unknown(detail) => HumanError {
            message: "Something unexpected went wrong.".into(),
            suggestion: format!("Try again. If this keeps happening, please report it. ({detail})"),
            retriable: true,
            severity: Severity::Transient,
        },
    }
}
