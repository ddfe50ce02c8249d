use std::collections::HashSet;

use regex::Regex;

use crate::auth::mint_opinion_id;
use crate::model::{Issue, Opinion, OpinionAction};

/// Shared normalized tokens required for two differently-keyed titles in the
/// same file to count as candidate duplicates.
const SHARED_TOKEN_FLOOR: usize = 3;

/// Lowercase a title, strip punctuation to spaces, and drop trivial tokens.
fn title_tokens(title: &str) -> Vec<String> {
    let strip = Regex::new(r"[^a-z0-9]+").unwrap();
    strip
        .replace_all(&title.to_lowercase(), " ")
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Full normalized title, used for the byte-identical merge path.
pub fn normalized_title(title: &str) -> String {
    title_tokens(title).join(" ")
}

/// Dedup group key: file path plus the first 4 normalized title tokens,
/// sorted alphabetically. Equal keys mark candidate duplicates.
pub fn group_key(file: &str, title: &str) -> String {
    let mut tokens = title_tokens(title);
    tokens.truncate(4);
    tokens.sort();
    format!("{file}|{}", tokens.join(" "))
}

fn shared_tokens(a: &str, b: &str) -> usize {
    let set_a: HashSet<String> = title_tokens(a).into_iter().collect();
    let set_b: HashSet<String> = title_tokens(b).into_iter().collect();
    set_a.intersection(&set_b).count()
}

/// Candidate duplicates: same file, and either equal group keys or enough
/// shared title tokens.
fn candidates(a: &Issue, b: &Issue) -> bool {
    a.file == b.file
        && (a.group_key == b.group_key
            || shared_tokens(&a.title, &b.title) >= SHARED_TOKEN_FLOOR)
}

fn ranges_mergeable(a: &Issue, b: &Issue, proximity: u32) -> bool {
    match (a.line_start, a.line_end, b.line_start, b.line_end) {
        (Some(a_start), Some(a_end), Some(b_start), Some(b_end)) => {
            let prox = proximity as i64;
            // Overlap, or gap between ranges within the proximity window.
            (a_start as i64) <= (b_end as i64) + prox && (b_start as i64) <= (a_end as i64) + prox
        }
        _ => false,
    }
}

/// The dedup predicate (C5): candidate duplicates collapse when their line
/// ranges overlap or sit within the proximity window, or when the normalized
/// titles are byte-identical.
pub fn mergeable(a: &Issue, b: &Issue, proximity: u32) -> bool {
    candidates(a, b)
        && (ranges_mergeable(a, b, proximity)
            || normalized_title(&a.title) == normalized_title(&b.title))
}

/// Result of a dedup pass: surviving canonical issues (with display numbers
/// assigned) and the IDs of issues merged away.
#[derive(Debug)]
pub struct DedupOutcome {
    pub canonical: Vec<Issue>,
    pub removed: Vec<String>,
}

/// Collapse near-duplicate raises into canonical issues (C5).
///
/// Deterministic: input is processed in insertion order, clusters keep that
/// order, and identical inputs yield identical canonical assignments and
/// numbering. Running the pass twice is a no-op the second time.
pub fn dedup(mut issues: Vec<Issue>, proximity: u32, next_display: &mut u32) -> DedupOutcome {
    issues.sort_by_key(|i| i.seq);

    // Greedy clustering in raise order; an issue joins the first cluster
    // containing any mergeable member.
    let mut clusters: Vec<Vec<Issue>> = Vec::new();
    for issue in issues {
        let target = clusters
            .iter()
            .position(|members| members.iter().any(|m| mergeable(m, &issue, proximity)));
        match target {
            Some(idx) => clusters[idx].push(issue),
            None => clusters.push(vec![issue]),
        }
    }

    let mut canonical = Vec::new();
    let mut removed = Vec::new();

    for members in clusters {
        // Canonical pick: highest severity, then earliest raise, then
        // lexicographic model ID.
        let winner_id = members
            .iter()
            .max_by(|a, b| {
                a.severity
                    .rank()
                    .cmp(&b.severity.rank())
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.raised_by.cmp(&a.raised_by))
            })
            .map(|i| i.id.clone())
            .expect("cluster is non-empty");

        let mut winner = None;
        let mut losers = Vec::new();
        for issue in members {
            if issue.id == winner_id {
                winner = Some(issue);
            } else {
                losers.push(issue);
            }
        }
        let mut winner = winner.expect("winner is a member");

        for loser in losers {
            removed.push(loser.id.clone());
            // The duplicate reporter's original raise joins the canonical
            // thread with its text preserved. A reviewer double-submitting
            // the same report does not get a second raise entry.
            if loser.raised_by != winner.raised_by
                && !winner
                    .opinions
                    .iter()
                    .any(|o| o.action == OpinionAction::Raise && o.model_id == loser.raised_by)
            {
                winner.opinions.push(Opinion {
                    id: mint_opinion_id(),
                    model_id: loser.raised_by.clone(),
                    action: OpinionAction::Raise,
                    reasoning: format!("{}: {}", loser.title, loser.description),
                    suggested_severity: Some(loser.severity),
                    confidence: None,
                    turn: 0,
                    timestamp: loser.created_at,
                    previous_status: None,
                    status_value: None,
                });
            }
        }

        canonical.push(winner);
    }

    // Display numbers in original raise order across all reviewers; numbers
    // already assigned are never changed.
    canonical.sort_by_key(|i| i.seq);
    for issue in canonical.iter_mut() {
        if issue.display_number.is_none() {
            issue.display_number = Some(*next_display);
            *next_display += 1;
        }
    }

    DedupOutcome { canonical, removed }
}
