//! Mandate scoring: turns flow counters and goal definitions into per-MP
//! achieved/stable/score values.

use std::collections::BTreeMap;

use crate::flow::FlowId;

/// A single mandate's requirement. At most one variant is active per
/// mandate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Requirement {
    /// Minimum required throughput, in bits per second.
    MinThroughputBps(f64),
    /// Maximum file-transfer deadline, in seconds. Scored by packet delivery
    /// ratio rather than directly by elapsed time, per the goal formula.
    FileDeadlineS(f64),
    /// Maximum tolerated latency, in seconds. Accepted on the wire for
    /// forward compatibility; the goal formula does not currently evaluate
    /// it.
    MaxLatencyS(f64),
}

/// A mandate: a scored goal attached to one flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mandate {
    /// The flow this mandate scores.
    pub flow_uid: FlowId,
    /// Number of consecutive MPs the goal must hold to count as stable.
    pub hold_period: u64,
    /// Points awarded per MP while the goal is stable.
    pub points: u32,
    /// The mandate's requirement.
    pub requirement: Requirement,
}

/// One MP's per-flow counters, as needed to evaluate a mandate's goal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringInput {
    /// Packets sent in this MP.
    pub npackets_sent: u64,
    /// Bytes sent in this MP.
    pub nbytes_sent: u64,
    /// Packets received in this MP.
    pub npackets_recv: u64,
    /// Bytes received in this MP.
    pub nbytes_recv: u64,
}

/// A derived scoring row for one (flow, MP) cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRow {
    /// `true`/`false`/unknown (forward-filled from the last known value, or
    /// 0 if none yet).
    pub goal: bool,
    /// 1-based run length of consecutive `goal == true` MPs, ending at and
    /// including this one.
    pub achieved_duration: u64,
    /// Whether `achieved_duration >= hold_period`.
    pub goal_stable: bool,
    /// `points` if `goal_stable`, else 0.
    pub mp_score: u32,
}

/// Per-flow scoring state: the current mandate, and the running goal/
/// achieved-duration history needed to score the next MP.
struct FlowState {
    mandate: Mandate,
    rows: BTreeMap<u64, ScoreRow>,
    /// Last known goal value, used to forward-fill MPs with no sent traffic.
    last_known_goal: Option<bool>,
    /// MP the current stage began at. `achieved_duration` never carries a
    /// run across this boundary even when a prior row exists for `mp - 1`.
    current_stage_start: u64,
    /// MP each stage began at, kept for historical stage lookups (see
    /// `stage_for_mp`).
    stage_timestamps: Vec<u64>,
}

impl FlowState {
    fn new(mandate: Mandate, stage_start_mp: u64) -> Self {
        Self {
            mandate,
            rows: BTreeMap::new(),
            last_known_goal: None,
            current_stage_start: stage_start_mp,
            stage_timestamps: vec![stage_start_mp],
        }
    }
}

fn evaluate_goal(requirement: Requirement, input: &ScoringInput) -> Option<bool> {
    if input.nbytes_sent == 0 {
        return None;
    }
    let met = match requirement {
        Requirement::MinThroughputBps(min_bps) => {
            (input.nbytes_recv as f64 * 8.0) >= min_bps || input.nbytes_recv == input.nbytes_sent
        }
        Requirement::FileDeadlineS(_) => {
            input.npackets_sent > 0
                && (input.npackets_recv as f64 / input.npackets_sent as f64) >= 0.9
        }
        Requirement::MaxLatencyS(_) => false,
    };
    Some(met)
}

/// Turns flow counters and mandate definitions into per-MP scores.
#[derive(Default)]
pub struct MandateScorer {
    flows: BTreeMap<FlowId, FlowState>,
}

impl MandateScorer {
    /// Creates an empty scorer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the mandate for a flow, starting a new scoring
    /// stage at `stage_start_mp` (already snapped to the nearest MP by the
    /// caller). Scores for MPs before `stage_start_mp` are preserved; scores
    /// at or after it are discarded and a fresh hold-period run begins.
    pub fn set_mandate(&mut self, mandate: Mandate, stage_start_mp: u64) {
        match self.flows.get_mut(&mandate.flow_uid) {
            Some(state) => {
                state.rows.retain(|&mp, _| mp < stage_start_mp);
                state.mandate = mandate;
                state.last_known_goal = state
                    .rows
                    .range(..stage_start_mp)
                    .next_back()
                    .map(|(_, row)| row.goal);
                state.current_stage_start = stage_start_mp;
                state.stage_timestamps.push(stage_start_mp);
            }
            None => {
                self.flows
                    .insert(mandate.flow_uid, FlowState::new(mandate, stage_start_mp));
            }
        }
    }

    /// Scores one MP for a flow that already has a mandate installed.
    /// No-op if the flow has no mandate.
    pub fn score_mp(&mut self, flow_uid: FlowId, mp: u64, input: ScoringInput) {
        let Some(state) = self.flows.get_mut(&flow_uid) else {
            return;
        };

        let raw_goal = evaluate_goal(state.mandate.requirement, &input);
        let goal = raw_goal.or(state.last_known_goal).unwrap_or(false);
        state.last_known_goal = Some(goal);

        let prev_duration = mp
            .checked_sub(1)
            .filter(|&prev_mp| prev_mp >= state.current_stage_start)
            .and_then(|prev_mp| state.rows.get(&prev_mp))
            .map(|row| row.achieved_duration)
            .unwrap_or(0);
        let achieved_duration = if goal { prev_duration + 1 } else { 0 };
        let goal_stable = achieved_duration >= state.mandate.hold_period;
        let mp_score = if goal_stable { state.mandate.points } else { 0 };

        state.rows.insert(
            mp,
            ScoreRow {
                goal,
                achieved_duration,
                goal_stable,
                mp_score,
            },
        );
    }

    /// Returns the score row for a (flow, MP) cell, if scored.
    #[must_use]
    pub fn score(&self, flow_uid: FlowId, mp: u64) -> Option<ScoreRow> {
        self.flows.get(&flow_uid)?.rows.get(&mp).copied()
    }

    /// Counts flows whose goal was stable at `mp`, for
    /// `score_reported.csv`'s `mandates_achieved` column.
    #[must_use]
    pub fn stable_count(&self, mp: u64) -> u32 {
        self.flows
            .values()
            .filter_map(|state| state.rows.get(&mp))
            .filter(|row| row.goal_stable)
            .count() as u32
    }

    /// Sums `mp_score` across all flows for one MP.
    #[must_use]
    pub fn ensemble_score(&self, mp: u64) -> u32 {
        self.flows
            .values()
            .filter_map(|state| state.rows.get(&mp))
            .map(|row| row.mp_score)
            .sum()
    }

    /// Evaluates an ensemble score against a points threshold.
    #[must_use]
    pub fn threshold_met_points(&self, mp: u64, scoring_point_threshold: u32) -> bool {
        self.ensemble_score(mp) >= scoring_point_threshold
    }

    /// Evaluates an ensemble score against a percentage of the maximum
    /// possible score (sum of all flows' `points`) at this MP.
    #[must_use]
    pub fn threshold_met_percent(&self, mp: u64, scoring_percent_threshold: f64) -> bool {
        let max_possible: u32 = self.flows.values().map(|s| s.mandate.points).sum();
        if max_possible == 0 {
            return false;
        }
        let achieved = self.ensemble_score(mp) as f64;
        (achieved / max_possible as f64) * 100.0 >= scoring_percent_threshold
    }

    /// Returns the stage-start MP that governed scoring at `mp`, for
    /// historical reporting (`score_reported.csv` dumps need to know which
    /// stage produced an old row).
    #[must_use]
    pub fn stage_for_mp(&self, flow_uid: FlowId, mp: u64) -> Option<u64> {
        let state = self.flows.get(&flow_uid)?;
        state
            .stage_timestamps
            .iter()
            .rev()
            .find(|&&start| start <= mp)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throughput_mandate(hold_period: u64, points: u32, min_bps: f64) -> Mandate {
        Mandate {
            flow_uid: 101,
            hold_period,
            points,
            requirement: Requirement::MinThroughputBps(min_bps),
        }
    }

    #[test]
    fn throughput_mandate_scores_stable_after_hold_period() {
        let mut scorer = MandateScorer::new();
        scorer.set_mandate(throughput_mandate(5, 2, 1_000_000.0), 0);

        for mp in 0..10u64 {
            scorer.score_mp(
                101,
                mp,
                ScoringInput {
                    npackets_sent: 1,
                    nbytes_sent: 200_000,
                    npackets_recv: 1,
                    nbytes_recv: 200_000,
                },
            );
        }

        for mp in 0..10u64 {
            let row = scorer.score(101, mp).unwrap();
            assert!(row.goal);
            assert_eq!(row.achieved_duration, mp + 1);
        }
        for mp in 0..4u64 {
            assert!(!scorer.score(101, mp).unwrap().goal_stable);
        }
        for mp in 4..10u64 {
            let row = scorer.score(101, mp).unwrap();
            assert!(row.goal_stable);
            assert_eq!(row.mp_score, 2);
        }
    }

    #[test]
    fn file_transfer_mandate_resets_on_ratio_drop() {
        let mandate = Mandate {
            flow_uid: 7,
            hold_period: 3,
            points: 1,
            requirement: Requirement::FileDeadlineS(30.0),
        };
        let mut scorer = MandateScorer::new();
        scorer.set_mandate(mandate, 0);

        for mp in 0..3u64 {
            scorer.score_mp(
                7,
                mp,
                ScoringInput {
                    npackets_sent: 100,
                    nbytes_sent: 1,
                    npackets_recv: 95,
                    nbytes_recv: 1,
                },
            );
        }
        scorer.score_mp(
            7,
            3,
            ScoringInput {
                npackets_sent: 100,
                nbytes_sent: 1,
                npackets_recv: 80,
                nbytes_recv: 1,
            },
        );

        assert!(scorer.score(7, 2).unwrap().goal);
        let dropped = scorer.score(7, 3).unwrap();
        assert!(!dropped.goal);
        assert_eq!(dropped.achieved_duration, 0);
    }

    #[test]
    fn nan_mps_are_forward_filled() {
        let mut scorer = MandateScorer::new();
        scorer.set_mandate(throughput_mandate(2, 1, 1_000_000.0), 0);

        scorer.score_mp(
            101,
            0,
            ScoringInput {
                npackets_sent: 1,
                nbytes_sent: 200_000,
                npackets_recv: 1,
                nbytes_recv: 200_000,
            },
        );
        // MP 1: no traffic sent -> goal is forward-filled from MP 0 (true).
        scorer.score_mp(101, 1, ScoringInput::default());

        let row = scorer.score(101, 1).unwrap();
        assert!(row.goal);
        assert_eq!(row.achieved_duration, 2);
    }

    #[test]
    fn leading_nan_with_no_history_becomes_zero() {
        let mut scorer = MandateScorer::new();
        scorer.set_mandate(throughput_mandate(2, 1, 1_000_000.0), 0);
        scorer.score_mp(101, 0, ScoringInput::default());
        let row = scorer.score(101, 0).unwrap();
        assert!(!row.goal);
        assert_eq!(row.achieved_duration, 0);
    }

    #[test]
    fn stage_transition_preserves_prior_scores_and_resets_duration() {
        let mut scorer = MandateScorer::new();
        scorer.set_mandate(throughput_mandate(5, 2, 1_000_000.0), 0);
        for mp in 0..120u64 {
            scorer.score_mp(
                101,
                mp,
                ScoringInput {
                    npackets_sent: 1,
                    nbytes_sent: 200_000,
                    npackets_recv: 1,
                    nbytes_recv: 200_000,
                },
            );
        }
        let pre_transition = scorer.score(101, 119).unwrap();
        assert_eq!(pre_transition.achieved_duration, 120);

        let file_mandate = Mandate {
            flow_uid: 101,
            hold_period: 3,
            points: 1,
            requirement: Requirement::FileDeadlineS(30.0),
        };
        scorer.set_mandate(file_mandate, 120);

        assert_eq!(scorer.score(101, 119).unwrap().achieved_duration, 120);
        assert!(scorer.score(101, 120).is_none());

        scorer.score_mp(
            101,
            120,
            ScoringInput {
                npackets_sent: 10,
                nbytes_sent: 1,
                npackets_recv: 10,
                nbytes_recv: 1,
            },
        );
        assert_eq!(scorer.score(101, 120).unwrap().achieved_duration, 1);
    }

    #[test]
    fn ensemble_score_sums_across_flows() {
        let mut scorer = MandateScorer::new();
        scorer.set_mandate(
            Mandate {
                flow_uid: 1,
                hold_period: 0,
                points: 2,
                requirement: Requirement::MinThroughputBps(1.0),
            },
            0,
        );
        scorer.set_mandate(
            Mandate {
                flow_uid: 2,
                hold_period: 0,
                points: 3,
                requirement: Requirement::MinThroughputBps(1.0),
            },
            0,
        );
        let input = ScoringInput {
            npackets_sent: 1,
            nbytes_sent: 1000,
            npackets_recv: 1,
            nbytes_recv: 1000,
        };
        scorer.score_mp(1, 0, input);
        scorer.score_mp(2, 0, input);
        assert_eq!(scorer.ensemble_score(0), 5);
        assert!(scorer.threshold_met_points(0, 5));
        assert!(!scorer.threshold_met_points(0, 6));
        assert_eq!(scorer.stable_count(0), 2);
    }
}
