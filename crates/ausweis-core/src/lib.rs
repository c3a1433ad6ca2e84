// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ausweis — Core types, error taxonomy, and configuration shared across crates.

pub mod config;
pub mod error;
pub mod human_errors;
pub mod types;

pub use config::{FallbackConfig, FallbackConfigUpdate};
pub use error::ScanError;
pub use types::*;
