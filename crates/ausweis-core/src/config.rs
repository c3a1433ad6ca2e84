// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Fallback engine configuration.
//
// A `FallbackConfig` is immutable for the lifetime of one session — the
// orchestrator snapshots it at request entry. Runtime updates are applied as
// a partial merge and take effect on the next session only.

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Timing and policy knobs for one scan session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Budget for the whole primary-method phase, in milliseconds.
    pub primary_timeout_ms: u64,
    /// Nominal budget for the secondary-method attempt. The effective budget
    /// is the smaller of this and whatever remains of `max_budget_ms`.
    pub secondary_timeout_ms: u64,
    /// Maximum decode attempts within one method phase.
    pub max_attempts: u32,
    /// Hard wall-clock ceiling for the whole session, fallback included.
    pub max_budget_ms: u64,
    /// When to warn that the primary method is taking long. Must be below
    /// `primary_timeout_ms`.
    pub warning_threshold_ms: u64,
    /// Deliberate pause between deciding to switch and activating the
    /// secondary method, to avoid visible thrashing in the host UI.
    pub switch_delay_ms: u64,
    /// Fallback is skipped when less than this much of the budget remains.
    pub min_secondary_budget_ms: u64,
    /// Rolling quality score below which a method switch is recommended.
    pub min_quality_score: f32,
    /// Whether auto-mode sessions may switch methods at all.
    pub fallback_enabled: bool,
    /// Base delay for per-attempt retry backoff.
    pub retry_base_delay_ms: u64,
    /// Cap on the per-attempt retry backoff delay.
    pub retry_max_delay_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            primary_timeout_ms: 3000,
            secondary_timeout_ms: 2000,
            max_attempts: 2,
            max_budget_ms: 8000,
            warning_threshold_ms: 2000,
            switch_delay_ms: 300,
            min_secondary_budget_ms: 500,
            min_quality_score: 0.4,
            fallback_enabled: true,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 400,
        }
    }
}

impl FallbackConfig {
    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.max_attempts == 0 {
            return Err(ScanError::InvalidInput(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.warning_threshold_ms >= self.primary_timeout_ms {
            return Err(ScanError::InvalidInput(format!(
                "warning_threshold_ms ({}) must be below primary_timeout_ms ({})",
                self.warning_threshold_ms, self.primary_timeout_ms
            )));
        }
        if self.max_budget_ms < self.primary_timeout_ms {
            return Err(ScanError::InvalidInput(format!(
                "max_budget_ms ({}) must cover primary_timeout_ms ({})",
                self.max_budget_ms, self.primary_timeout_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.min_quality_score) {
            return Err(ScanError::InvalidInput(format!(
                "min_quality_score ({}) must be within [0, 1]",
                self.min_quality_score
            )));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ScanError::InvalidInput(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Partial configuration record, merge-applied onto the current config.
///
/// Every field is optional; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfigUpdate {
    pub primary_timeout_ms: Option<u64>,
    pub secondary_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub max_budget_ms: Option<u64>,
    pub warning_threshold_ms: Option<u64>,
    pub switch_delay_ms: Option<u64>,
    pub min_secondary_budget_ms: Option<u64>,
    pub min_quality_score: Option<f32>,
    pub fallback_enabled: Option<bool>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
}

impl FallbackConfigUpdate {
    /// Merge the set fields onto `config`.
    pub fn apply(&self, config: &mut FallbackConfig) {
        if let Some(v) = self.primary_timeout_ms {
            config.primary_timeout_ms = v;
        }
        if let Some(v) = self.secondary_timeout_ms {
            config.secondary_timeout_ms = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.max_budget_ms {
            config.max_budget_ms = v;
        }
        if let Some(v) = self.warning_threshold_ms {
            config.warning_threshold_ms = v;
        }
        if let Some(v) = self.switch_delay_ms {
            config.switch_delay_ms = v;
        }
        if let Some(v) = self.min_secondary_budget_ms {
            config.min_secondary_budget_ms = v;
        }
        if let Some(v) = self.min_quality_score {
            config.min_quality_score = v;
        }
        if let Some(v) = self.fallback_enabled {
            config.fallback_enabled = v;
        }
        if let Some(v) = self.retry_base_delay_ms {
            config.retry_base_delay_ms = v;
        }
        if let Some(v) = self.retry_max_delay_ms {
            config.retry_max_delay_ms = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        FallbackConfig::default().validate().expect("valid default");
    }

    #[test]
    fn warning_must_precede_primary_timeout() {
        let config = FallbackConfig {
            warning_threshold_ms: 3000,
            primary_timeout_ms: 3000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = FallbackConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn budget_must_cover_primary_phase() {
        let config = FallbackConfig {
            max_budget_ms: 1000,
            primary_timeout_ms: 3000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn quality_score_bounds_enforced() {
        let config = FallbackConfig {
            min_quality_score: 1.2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_update_merges_only_set_fields() {
        let mut config = FallbackConfig::default();
        let update = FallbackConfigUpdate {
            primary_timeout_ms: Some(4000),
            fallback_enabled: Some(false),
            ..Default::default()
        };
        update.apply(&mut config);
        assert_eq!(config.primary_timeout_ms, 4000);
        assert!(!config.fallback_enabled);
        // Untouched fields keep their defaults.
        assert_eq!(config.secondary_timeout_ms, 2000);
        assert_eq!(config.max_attempts, 2);
    }
}
