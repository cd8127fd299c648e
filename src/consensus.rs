// =============================================================================
// Weighted Consensus Engine — regime-aware verdict aggregation
// =============================================================================
//
// Combines per-source verdicts into a single (action, confidence) pair, or
// "no signal". Pure function of its inputs: the same verdict list, weight
// vector and regime always produce the same output.
//
// Pipeline:
//   1. Discard verdicts below the per-regime confidence floor. NEUTRAL
//      additionally needs confidence >= 65 to contribute at all.
//   2. NEUTRAL survivors split 55/45 between LONG and SHORT; directional
//      survivors vote fully on their side.
//   3. vote = sum(weight * confidence * side_share).
//   4. Near-tied votes (margin below the tie-break) emit nothing; this stops
//      marginal flips from oscillating between cycles.
//   5. Consensus confidence is the weighted mean confidence of survivors.
//   6. The accept threshold depends on the verdict mix and the regime.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::ConsensusParams;
use crate::signal::SourceVerdict;
use crate::types::{Action, Regime, Verdict};

/// Confidence below which a NEUTRAL verdict contributes no vote at all.
const NEUTRAL_VOTE_FLOOR: f64 = 65.0;

/// One surviving verdict's share of the final vote.
#[derive(Debug, Clone, Serialize)]
pub struct VoteContribution {
    pub source_id: String,
    pub weight: f64,
    pub confidence: f64,
    pub vote_long: f64,
    pub vote_short: f64,
}

/// Why consensus declined to emit. Not an error; a normal outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NoSignalReason {
    /// Nothing survived the confidence floors (or weights were all zero).
    NoSurvivors,
    /// Every survivor was NEUTRAL — nothing directional to act on.
    AllNeutral,
    /// Votes were too close to call.
    MarginTie { margin: f64 },
    /// Confidence fell short of the mix-dependent accept threshold.
    BelowThreshold { confidence: f64, threshold: f64 },
}

/// Outcome of one consensus evaluation.
#[derive(Debug, Clone, Serialize)]
pub enum ConsensusDecision {
    Emit {
        action: Action,
        confidence: f64,
        contributions: Vec<VoteContribution>,
    },
    NoSignal { reason: NoSignalReason },
}

impl ConsensusDecision {
    pub fn emitted(&self) -> Option<(Action, f64)> {
        match self {
            Self::Emit {
                action, confidence, ..
            } => Some((*action, *confidence)),
            Self::NoSignal { .. } => None,
        }
    }
}

/// Evaluate consensus over `verdicts` with the given weight vector.
///
/// Sources missing from `weights` carry zero weight and therefore do not
/// contribute. `weights` values are expected to sum to <= 1 (validated at
/// config load).
pub fn evaluate(
    verdicts: &[SourceVerdict],
    weights: &HashMap<String, f64>,
    regime: Regime,
    params: &ConsensusParams,
) -> ConsensusDecision {
    let floor = match regime {
        Regime::Unknown => params.floor_unknown,
        _ => params.floor_directional,
    };

    // --- Step 1-2: survivors and their vote shares --------------------------
    let mut contributions: Vec<VoteContribution> = Vec::new();
    let mut directional_survivors = 0usize;
    let mut neutral_survivors = 0usize;
    let mut long_present = false;
    let mut short_present = false;

    for verdict in verdicts {
        if verdict.confidence < floor {
            continue;
        }
        let weight = weights.get(&verdict.source_id).copied().unwrap_or(0.0);
        if weight <= 0.0 {
            continue;
        }

        let (p_long, p_short) = match verdict.verdict {
            Verdict::Long => {
                directional_survivors += 1;
                long_present = true;
                (1.0, 0.0)
            }
            Verdict::Short => {
                directional_survivors += 1;
                short_present = true;
                (0.0, 1.0)
            }
            Verdict::Neutral => {
                if verdict.confidence < NEUTRAL_VOTE_FLOOR {
                    continue;
                }
                neutral_survivors += 1;
                (params.neutral_split_long, 1.0 - params.neutral_split_long)
            }
        };

        contributions.push(VoteContribution {
            source_id: verdict.source_id.clone(),
            weight,
            confidence: verdict.confidence,
            vote_long: weight * verdict.confidence * p_long,
            vote_short: weight * verdict.confidence * p_short,
        });
    }

    let survivors = directional_survivors + neutral_survivors;
    if survivors == 0 {
        return ConsensusDecision::NoSignal {
            reason: NoSignalReason::NoSurvivors,
        };
    }
    if directional_survivors == 0 {
        return ConsensusDecision::NoSignal {
            reason: NoSignalReason::AllNeutral,
        };
    }

    // --- Step 3-4: votes and the tie-break ----------------------------------
    let vote_long: f64 = contributions.iter().map(|c| c.vote_long).sum();
    let vote_short: f64 = contributions.iter().map(|c| c.vote_short).sum();
    let vote_total = vote_long + vote_short;
    if vote_total <= 0.0 {
        return ConsensusDecision::NoSignal {
            reason: NoSignalReason::NoSurvivors,
        };
    }

    let margin = (vote_long - vote_short).abs() / vote_total;
    if margin < params.margin_tiebreak {
        return ConsensusDecision::NoSignal {
            reason: NoSignalReason::MarginTie { margin },
        };
    }

    let action = if vote_long > vote_short {
        Action::Long
    } else {
        Action::Short
    };

    // --- Step 5: weighted mean confidence of survivors ----------------------
    let weight_sum: f64 = contributions.iter().map(|c| c.weight).sum();
    let confidence = (contributions
        .iter()
        .map(|c| c.weight * c.confidence)
        .sum::<f64>()
        / weight_sum)
        .clamp(0.0, 100.0);

    // --- Step 6: mix-dependent accept threshold -----------------------------
    let threshold = match (survivors, directional_survivors, neutral_survivors) {
        (1, 1, 0) => params.threshold_single_directional,
        (2, 2, 0) if long_present && short_present => {
            // Two opposing directionals: hold the winner to the single-source
            // bar.
            params.threshold_single_directional
        }
        (2, 2, 0) => params.threshold_two_same,
        (2, 1, 1) => params.threshold_two_mixed,
        _ => match regime {
            Regime::Trending => params.base_threshold_trending,
            _ => params.base_threshold_default,
        },
    };

    if confidence < threshold {
        return ConsensusDecision::NoSignal {
            reason: NoSignalReason::BelowThreshold {
                confidence,
                threshold,
            },
        };
    }

    ConsensusDecision::Emit {
        action,
        confidence,
        contributions,
    }
}
