// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Rolling frame-quality evaluation.
//
// Converts a stream of per-frame quality samples into a single switch
// recommendation. A small FIFO buffer keeps the last few samples so one bad
// frame never triggers a method switch on its own.

use std::collections::VecDeque;

use ausweis_core::types::{QualitySample, ScanMode};

/// How many samples the rolling buffer retains.
pub const WINDOW_CAPACITY: usize = 5;

/// Minimum buffered samples before a switch recommendation may fire.
pub const MIN_SAMPLES_FOR_DECISION: usize = 3;

/// Stateless scoring plus a bounded rolling buffer of recent samples.
#[derive(Debug)]
pub struct QualityEvaluator {
    /// Recent samples with their scores, oldest first.
    window: VecDeque<(QualitySample, f32)>,
    /// Score below which a switch is recommended.
    min_quality_score: f32,
}

/// Composite quality score for one frame: the mean of sharpness,
/// illumination, glare-freedom, and alignment, each in `[0, 1]`.
pub fn assess_quality(sample: &QualitySample) -> f32 {
    (sample.sharpness + sample.illumination + (1.0 - sample.glare) + sample.alignment) / 4.0
}

impl QualityEvaluator {
    pub fn new(min_quality_score: f32) -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            min_quality_score,
        }
    }

    /// Score a sample and push it into the rolling buffer, evicting the
    /// oldest entry once the buffer is full. Returns the sample's score.
    pub fn record(&mut self, sample: QualitySample) -> f32 {
        let score = assess_quality(&sample);
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back((sample, score));
        score
    }

    /// The buffered samples, oldest first.
    pub fn recent_samples(&self) -> Vec<QualitySample> {
        self.window.iter().map(|(sample, _)| *sample).collect()
    }

    /// Number of buffered samples.
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Mean score of the most recent `MIN_SAMPLES_FOR_DECISION` samples, or
    /// `None` while the buffer holds fewer than that.
    pub fn recent_average(&self) -> Option<f32> {
        if self.window.len() < MIN_SAMPLES_FOR_DECISION {
            return None;
        }
        let tail = self
            .window
            .iter()
            .rev()
            .take(MIN_SAMPLES_FOR_DECISION)
            .map(|(_, score)| score)
            .sum::<f32>();
        Some(tail / MIN_SAMPLES_FOR_DECISION as f32)
    }

    /// Whether the recent frames are bad enough to abandon the primary
    /// method. Never true with fewer than `MIN_SAMPLES_FOR_DECISION` samples.
    pub fn should_recommend_switch(&self) -> bool {
        self.recent_average()
            .is_some_and(|average| average < self.min_quality_score)
    }

    /// The mode the evaluator would pick right now.
    pub fn recommended_mode(&self) -> ScanMode {
        if self.should_recommend_switch() {
            ScanMode::Secondary
        } else {
            ScanMode::Primary
        }
    }

    /// Empty the buffer (session teardown).
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bad_frame() -> QualitySample {
        QualitySample::clamped(0.1, 0.2, 0.8, 0.1)
    }

    fn good_frame() -> QualitySample {
        QualitySample::clamped(0.9, 0.9, 0.05, 0.95)
    }

    #[test]
    fn scoring_rewards_sharp_glare_free_frames() {
        assert!(assess_quality(&good_frame()) > 0.85);
        assert!(assess_quality(&bad_frame()) < 0.2);
    }

    #[test]
    fn no_recommendation_below_three_samples() {
        let mut evaluator = QualityEvaluator::new(0.4);
        evaluator.record(bad_frame());
        assert!(!evaluator.should_recommend_switch());
        evaluator.record(bad_frame());
        assert!(!evaluator.should_recommend_switch());
        evaluator.record(bad_frame());
        assert!(evaluator.should_recommend_switch());
    }

    #[test]
    fn three_bad_frames_recommend_secondary() {
        let mut evaluator = QualityEvaluator::new(0.4);
        for _ in 0..3 {
            evaluator.record(bad_frame());
        }
        assert!(evaluator.should_recommend_switch());
        assert_eq!(evaluator.recommended_mode(), ScanMode::Secondary);
    }

    #[test]
    fn good_frames_keep_primary() {
        let mut evaluator = QualityEvaluator::new(0.4);
        for _ in 0..5 {
            evaluator.record(good_frame());
        }
        assert!(!evaluator.should_recommend_switch());
        assert_eq!(evaluator.recommended_mode(), ScanMode::Primary);
    }

    #[test]
    fn recovery_clears_the_recommendation() {
        let mut evaluator = QualityEvaluator::new(0.4);
        for _ in 0..3 {
            evaluator.record(bad_frame());
        }
        assert!(evaluator.should_recommend_switch());
        // Three good frames push the decision window back above the bar.
        for _ in 0..3 {
            evaluator.record(good_frame());
        }
        assert!(!evaluator.should_recommend_switch());
    }

    #[test]
    fn buffer_is_bounded_fifo() {
        let mut evaluator = QualityEvaluator::new(0.4);
        for _ in 0..8 {
            evaluator.record(good_frame());
        }
        assert_eq!(evaluator.sample_count(), WINDOW_CAPACITY);
    }

    #[test]
    fn reset_empties_the_buffer() {
        let mut evaluator = QualityEvaluator::new(0.4);
        for _ in 0..4 {
            evaluator.record(bad_frame());
        }
        evaluator.reset();
        assert_eq!(evaluator.sample_count(), 0);
        assert!(!evaluator.should_recommend_switch());
    }
}
