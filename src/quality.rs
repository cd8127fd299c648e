// =============================================================================
// Quality Scorer + Calibrator — outcome-informed confidence adjustment
// =============================================================================
//
// The scorer looks up historical outcomes for the symbol within a confidence
// band and nudges confidence by up to +/-5 points. The calibrator is a
// pre-fit monotonic mapping loaded as an immutable artifact at startup;
// reloads replace the handle atomically. Both are best-effort: their failure
// never blocks signal emission.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::QualityParams;
use crate::store::OutcomeRow;
use crate::types::Outcome;

// =============================================================================
// Scorer
// =============================================================================

pub struct QualityScorer {
    params: QualityParams,
}

impl QualityScorer {
    pub fn new(params: QualityParams) -> Self {
        Self { params }
    }

    pub fn window_days(&self) -> i64 {
        self.params.window_days
    }

    /// Adjustment in [-5, +5] derived from the win rate of historical
    /// outcomes within `confidence_band` points of `confidence`. Returns 0
    /// when fewer than `min_outcomes` labelled rows fall in the band.
    /// EXPIRED outcomes carry no information and are excluded.
    pub fn adjustment(&self, outcomes: &[OutcomeRow], confidence: f64) -> f64 {
        let in_band: Vec<&OutcomeRow> = outcomes
            .iter()
            .filter(|row| (row.confidence - confidence).abs() <= self.params.confidence_band)
            .filter(|row| row.outcome != Outcome::Expired)
            .collect();

        if in_band.len() < self.params.min_outcomes {
            return 0.0;
        }

        let wins = in_band
            .iter()
            .filter(|row| row.outcome == Outcome::Win)
            .count();
        let win_rate = wins as f64 / in_band.len() as f64;
        let adjustment = ((win_rate - 0.5) * 10.0).clamp(-5.0, 5.0);

        debug!(
            win_rate = format!("{win_rate:.3}"),
            samples = in_band.len(),
            adjustment = format!("{adjustment:+.2}"),
            "quality adjustment computed"
        );
        adjustment
    }
}

// =============================================================================
// Calibrator
// =============================================================================

/// Minimum fitted sample size before the calibration curve applies; anything
/// smaller falls back to the identity mapping.
const MIN_CALIBRATION_SAMPLES: usize = 100;

#[derive(Debug, Deserialize)]
struct CalibrationArtifact {
    sample_count: usize,
    /// Monotonic (raw, calibrated) knots, raw ascending.
    points: Vec<(f64, f64)>,
}

/// Pre-fit monotonic confidence mapping. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Calibrator {
    points: Vec<(f64, f64)>,
}

impl Calibrator {
    /// The identity mapping, used when no artifact exists or the fit is too
    /// thin to trust.
    pub fn identity() -> Self {
        Self { points: Vec::new() }
    }

    /// Load the artifact from JSON. An artifact fitted on fewer than 100
    /// outcomes degrades to the identity.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read calibrator artifact {}", path.display()))?;
        let artifact: CalibrationArtifact = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse calibrator artifact {}", path.display()))?;

        if artifact.sample_count < MIN_CALIBRATION_SAMPLES {
            info!(
                samples = artifact.sample_count,
                "calibration sample too small, using identity"
            );
            return Ok(Self::identity());
        }

        let mut points = artifact.points;
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        points.retain(|(raw, cal)| raw.is_finite() && cal.is_finite());

        info!(knots = points.len(), "calibrator loaded");
        Ok(Self { points })
    }

    /// Map raw confidence to calibrated confidence by linear interpolation
    /// between the fitted knots, clamped to [0, 100].
    pub fn apply(&self, raw: f64) -> f64 {
        if self.points.len() < 2 {
            return raw.clamp(0.0, 100.0);
        }

        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if raw <= first.0 {
            return first.1.clamp(0.0, 100.0);
        }
        if raw >= last.0 {
            return last.1.clamp(0.0, 100.0);
        }

        for window in self.points.windows(2) {
            let (x0, y0) = window[0];
            let (x1, y1) = window[1];
            if raw >= x0 && raw <= x1 {
                let t = if (x1 - x0).abs() < f64::EPSILON {
                    0.0
                } else {
                    (raw - x0) / (x1 - x0)
                };
                return (y0 + t * (y1 - y0)).clamp(0.0, 100.0);
            }
        }

        raw.clamp(0.0, 100.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(confidence: f64, outcome: Outcome) -> OutcomeRow {
        OutcomeRow {
            confidence,
            outcome,
        }
    }

    fn params() -> QualityParams {
        QualityParams::default()
    }

    #[test]
    fn too_few_outcomes_means_no_adjustment() {
        let scorer = QualityScorer::new(params());
        let outcomes: Vec<OutcomeRow> =
            (0..10).map(|_| outcome(82.0, Outcome::Win)).collect();
        assert!(scorer.adjustment(&outcomes, 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn winning_history_boosts() {
        let scorer = QualityScorer::new(params());
        let mut outcomes: Vec<OutcomeRow> =
            (0..18).map(|_| outcome(81.0, Outcome::Win)).collect();
        outcomes.extend((0..6).map(|_| outcome(79.0, Outcome::Loss)));
        let adj = scorer.adjustment(&outcomes, 80.0);
        assert!(adj > 0.0 && adj <= 5.0, "got {adj}");
    }

    #[test]
    fn losing_history_cuts() {
        let scorer = QualityScorer::new(params());
        let mut outcomes: Vec<OutcomeRow> =
            (0..6).map(|_| outcome(81.0, Outcome::Win)).collect();
        outcomes.extend((0..18).map(|_| outcome(79.0, Outcome::Loss)));
        let adj = scorer.adjustment(&outcomes, 80.0);
        assert!(adj < 0.0 && adj >= -5.0, "got {adj}");
    }

    #[test]
    fn adjustment_is_clamped() {
        let scorer = QualityScorer::new(params());
        let outcomes: Vec<OutcomeRow> =
            (0..50).map(|_| outcome(80.0, Outcome::Win)).collect();
        assert!((scorer.adjustment(&outcomes, 80.0) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_band_outcomes_ignored() {
        let scorer = QualityScorer::new(params());
        // All samples are 20 points away from the query confidence.
        let outcomes: Vec<OutcomeRow> =
            (0..50).map(|_| outcome(60.0, Outcome::Win)).collect();
        assert!(scorer.adjustment(&outcomes, 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn expired_outcomes_carry_no_information() {
        let scorer = QualityScorer::new(params());
        let outcomes: Vec<OutcomeRow> =
            (0..50).map(|_| outcome(80.0, Outcome::Expired)).collect();
        assert!(scorer.adjustment(&outcomes, 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn identity_calibrator_passes_through() {
        let calibrator = Calibrator::identity();
        assert!((calibrator.apply(83.2) - 83.2).abs() < f64::EPSILON);
        assert!((calibrator.apply(150.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fitted_calibrator_interpolates() {
        let calibrator = Calibrator {
            points: vec![(60.0, 55.0), (80.0, 78.0), (100.0, 95.0)],
        };
        // Exactly on a knot.
        assert!((calibrator.apply(80.0) - 78.0).abs() < 1e-9);
        // Midway between knots.
        assert!((calibrator.apply(70.0) - 66.5).abs() < 1e-9);
        // Clamped at the edges.
        assert!((calibrator.apply(40.0) - 55.0).abs() < 1e-9);
        assert!((calibrator.apply(120.0) - 95.0).abs() < 1e-9);
    }

    #[test]
    fn thin_artifact_degrades_to_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrator.json");
        std::fs::write(
            &path,
            r#"{"sample_count": 40, "points": [[60.0, 50.0], [90.0, 85.0]]}"#,
        )
        .unwrap();
        let calibrator = Calibrator::load(&path).unwrap();
        assert!((calibrator.apply(75.0) - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rich_artifact_loads_curve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrator.json");
        std::fs::write(
            &path,
            r#"{"sample_count": 500, "points": [[60.0, 50.0], [90.0, 85.0]]}"#,
        )
        .unwrap();
        let calibrator = Calibrator::load(&path).unwrap();
        assert!((calibrator.apply(75.0) - 67.5).abs() < 1e-9);
    }
}
