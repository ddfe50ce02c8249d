use std::collections::HashMap;

use crate::model::{
    AgentConfig, ConsensusType, Issue, OpinionAction, Severity, Strictness,
};

/// Floor applied to reviewer-supplied confidence so a vote never vanishes.
const CONFIDENCE_FLOOR: f64 = 0.1;

/// One voter's effective (latest) vote.
#[derive(Debug, Clone)]
struct Vote {
    action: OpinionAction,
    weight: f64,
    suggested_severity: Option<Severity>,
    turn: u32,
}

/// Outcome of a consensus evaluation over one issue's thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub consensus: Option<bool>,
    pub consensus_type: ConsensusType,
    pub final_severity: Option<Severity>,
    pub fix_weight: f64,
    pub no_fix_weight: f64,
    /// Set when a `false_positive` vote asks the raiser to re-examine.
    pub raiser_review_requested: bool,
}

impl ConsensusOutcome {
    fn undecided(fix_weight: f64, no_fix_weight: f64, review: bool) -> Self {
        Self {
            consensus: None,
            consensus_type: ConsensusType::Undecided,
            final_severity: None,
            fix_weight,
            no_fix_weight,
            raiser_review_requested: review,
        }
    }
}

fn strictness_of(agents: &[AgentConfig], model_id: &str) -> Strictness {
    agents
        .iter()
        .find(|a| a.model_id == model_id)
        .map(|a| a.strictness)
        .unwrap_or_default()
}

/// Latest vote-bearing opinion per voter, in thread order. The raise itself
/// stands as the raiser's initial `fix_required` vote until the raiser votes
/// again.
fn latest_votes(issue: &Issue, agents: &[AgentConfig]) -> HashMap<String, Vote> {
    let mut votes: HashMap<String, Vote> = HashMap::new();

    // The raise opinion is implicit: the issue fields carry it (I5). Synthetic
    // raises merged in by dedup count the same way for their reporters.
    votes.insert(
        issue.raised_by.clone(),
        Vote {
            action: OpinionAction::FixRequired,
            weight: strictness_of(agents, &issue.raised_by).weight(),
            suggested_severity: Some(issue.severity),
            turn: issue.turn,
        },
    );

    for opinion in &issue.opinions {
        let action = match opinion.action {
            OpinionAction::Raise => OpinionAction::FixRequired,
            a if a.is_vote() => a,
            _ => continue,
        };
        let weight = match opinion.confidence {
            Some(c) => c.max(CONFIDENCE_FLOOR),
            None => strictness_of(agents, &opinion.model_id).weight(),
        };
        votes.insert(
            opinion.model_id.clone(),
            Vote {
                action,
                weight,
                suggested_severity: opinion.suggested_severity,
                turn: opinion.turn,
            },
        );
    }

    votes
}

/// Weighted median of suggested severities; falls back to the raise severity
/// when no voter suggested one.
fn weighted_median_severity(votes: &HashMap<String, Vote>, fallback: Severity) -> Severity {
    let mut ranked: Vec<(u8, f64)> = votes
        .values()
        .filter_map(|v| v.suggested_severity.map(|s| (s.rank(), v.weight)))
        .collect();
    if ranked.is_empty() {
        return fallback;
    }
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    let total: f64 = ranked.iter().map(|(_, w)| w).sum();
    let mut cumulative = 0.0;
    for (rank, weight) in &ranked {
        cumulative += weight;
        if cumulative * 2.0 >= total {
            return Severity::from_rank(*rank);
        }
    }
    fallback
}

/// Compute the confidence-weighted verdict for one issue (C6).
///
/// Threshold first: one side must exceed the other by at least `threshold`.
/// When the margin is not met but every enabled non-raiser reviewer has a
/// vote in the current turn, fall back to a simple majority of latest votes;
/// a tie stays undecided for the operator.
pub fn evaluate(
    issue: &Issue,
    agents: &[AgentConfig],
    threshold: f64,
    current_turn: u32,
) -> ConsensusOutcome {
    let votes = latest_votes(issue, agents);

    let mut fix_weight = 0.0;
    let mut no_fix_weight = 0.0;
    let mut fix_count = 0usize;
    let mut no_fix_count = 0usize;
    let mut review_requested = false;

    for vote in votes.values() {
        match vote.action {
            OpinionAction::FixRequired => {
                fix_weight += vote.weight;
                fix_count += 1;
            }
            OpinionAction::NoFix => {
                no_fix_weight += vote.weight;
                no_fix_count += 1;
            }
            OpinionAction::FalsePositive => {
                no_fix_weight += vote.weight;
                no_fix_count += 1;
                review_requested = true;
            }
            _ => {}
        }
    }

    let decide = |fix_side: bool| {
        let consensus_type = if fix_side {
            ConsensusType::FixRequired
        } else {
            ConsensusType::Dismissed
        };
        ConsensusOutcome {
            consensus: Some(true),
            consensus_type,
            final_severity: Some(weighted_median_severity(&votes, issue.severity)),
            fix_weight,
            no_fix_weight,
            raiser_review_requested: review_requested,
        }
    };

    if fix_weight - no_fix_weight >= threshold {
        return decide(true);
    }
    if no_fix_weight - fix_weight >= threshold {
        return decide(false);
    }

    // Deadlock bypass: every enabled non-raiser voice heard this turn.
    let all_voices_heard = agents
        .iter()
        .filter(|a| a.enabled && a.model_id != issue.raised_by)
        .all(|a| votes.get(&a.model_id).is_some_and(|v| v.turn == current_turn));

    if all_voices_heard {
        if fix_count > no_fix_count {
            return decide(true);
        }
        if no_fix_count > fix_count {
            return decide(false);
        }
    }

    ConsensusOutcome::undecided(fix_weight, no_fix_weight, review_requested)
}
