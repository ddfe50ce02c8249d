mod common;

use std::sync::Arc;

use arv::error::Error;
use arv::lifecycle::{Engine, ReportRequest};
use arv::model::{
    AgentStatus, ConsensusType, OpinionAction, Phase, ProgressStatus, RespondAction, Severity,
    Strictness,
};
use common::*;
use tempfile::TempDir;

fn report(title: &str, severity: Severity, file: &str, start: u32, end: u32) -> ReportRequest {
    ReportRequest {
        title: title.to_string(),
        severity,
        file: file.to_string(),
        line: None,
        line_start: Some(start),
        line_end: Some(end),
        description: format!("details: {title}"),
        suggestion: None,
    }
}

/// Session with the given agents, started against the fixture repo, with
/// reviewer subprocesses parked on a sleep.
async fn started_session(
    agents: Vec<arv::model::AgentConfig>,
) -> (TempDir, TempDir, Arc<Engine>, String) {
    let repo = setup_review_repo();
    let storage = TempDir::new().unwrap();
    let binary = fake_agent_binary(storage.path(), "sleep 60");
    let engine = test_engine(storage.path(), Some(binary));
    let sid = engine
        .create_session(create_request(repo.path(), agents))
        .await
        .unwrap();
    engine.start(&sid).await.unwrap();
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Reviewing);
    (repo, storage, engine, sid)
}

/// Scenario 1: two reviewers, one issue, consensus fix.
#[tokio::test]
async fn two_reviewers_reach_fix_consensus() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    let issue = engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("off-by-one in loop", Severity::High, "src/loop.rs", 10, 12),
        )
        .await
        .unwrap();
    engine
        .submit_summary(&sid, "model-a", &tok_a, "one issue in the loop bound")
        .await
        .unwrap();
    engine
        .submit_summary(&sid, "model-b", &tok_b, "nothing further")
        .await
        .unwrap();

    // Both reviewers terminal: reviewing ran through dedup into deliberation.
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Deliberating);
    assert_eq!(session.turn, 1);

    let issues = engine.issues_snapshot(&sid).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].display_number, Some(1));

    engine
        .submit_opinion(
            &issue.id,
            "model-b",
            &tok_b,
            OpinionAction::FixRequired,
            "agree, the last element is skipped",
            None,
            Some(0.8),
        )
        .await
        .unwrap();

    let decided = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(decided.consensus, Some(true));
    assert_eq!(decided.consensus_type, ConsensusType::FixRequired);
    // No voter suggested a severity, so the raise severity stands.
    assert_eq!(decided.final_severity, Some(Severity::High));

    // The author gate holds: finish without fixes names the open issue.
    match engine.finish(&sid, false).await.unwrap_err() {
        Error::Unresolved(ids) => assert_eq!(ids, vec![issue.id.clone()]),
        other => panic!("expected unresolved conflict, got {other}"),
    }
}

/// Scenario 2: near-duplicate reports collapse to one canonical issue.
#[tokio::test]
async fn dedup_collapses_duplicate_reports() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Balanced),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("null deref in parse", Severity::High, "src/parse.go", 40, 40),
        )
        .await
        .unwrap();
    engine
        .report_issue(
            &sid,
            "model-b",
            &tok_b,
            report(
                "possible null pointer in parse",
                Severity::High,
                "src/parse.go",
                41,
                41,
            ),
        )
        .await
        .unwrap();
    engine
        .submit_summary(&sid, "model-a", &tok_a, "one finding")
        .await
        .unwrap();
    engine
        .submit_summary(&sid, "model-b", &tok_b, "one finding")
        .await
        .unwrap();

    let issues = engine.issues_snapshot(&sid).unwrap();
    assert_eq!(issues.len(), 1, "duplicates must collapse");
    let canonical = &issues[0];
    assert_eq!(canonical.display_number, Some(1));
    // Both original raises live on the canonical thread.
    let raises: Vec<&str> = canonical
        .opinions
        .iter()
        .filter(|o| o.action == OpinionAction::Raise)
        .map(|o| o.model_id.as_str())
        .collect();
    assert!(raises.contains(&"model-a"));
    assert!(raises.contains(&"model-b"));
    assert!(canonical.opinions.iter().all(|o| o.turn == 0 || !matches!(o.action, OpinionAction::Raise)));
}

/// Scenario 3: withdraw closes immediately and freezes the thread.
#[tokio::test]
async fn withdraw_closes_issue_immediately() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    let issue = engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("off-by-one in loop", Severity::High, "src/loop.rs", 10, 12),
        )
        .await
        .unwrap();
    engine
        .submit_summary(&sid, "model-a", &tok_a, "one issue")
        .await
        .unwrap();
    engine
        .submit_summary(&sid, "model-b", &tok_b, "clean")
        .await
        .unwrap();

    engine
        .submit_opinion(
            &issue.id,
            "model-a",
            &tok_a,
            OpinionAction::Withdraw,
            "retracted, misread the slice bounds",
            None,
            None,
        )
        .await
        .unwrap();

    let closed = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(closed.consensus, Some(true));
    assert_eq!(closed.consensus_type, ConsensusType::Closed);
    // Display number survives the close.
    assert_eq!(closed.display_number, Some(1));

    let err = engine
        .submit_opinion(
            &issue.id,
            "model-b",
            &tok_b,
            OpinionAction::Comment,
            "too late",
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "state");

    // A closed issue no longer gates finish.
    engine.finish(&sid, false).await.unwrap();
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Complete);
}

/// Scenario 4: threshold unmet, but all voices heard decide by majority.
#[tokio::test]
async fn deadlock_bypass_decides_by_majority() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Balanced),
        agent("model-b", Strictness::Balanced),
        agent("model-c", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");
    let tok_c = token_for(&engine, &sid, "model-c");

    let issue = engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("unchecked index in total", Severity::Medium, "src/loop.rs", 3, 3),
        )
        .await
        .unwrap();
    for (model, tok) in [("model-a", &tok_a), ("model-b", &tok_b), ("model-c", &tok_c)] {
        engine.submit_summary(&sid, model, tok, "done").await.unwrap();
    }

    engine
        .submit_opinion(&issue.id, "model-a", &tok_a, OpinionAction::FixRequired, "still sure", None, Some(0.3))
        .await
        .unwrap();
    engine
        .submit_opinion(&issue.id, "model-b", &tok_b, OpinionAction::FixRequired, "agree", None, Some(0.3))
        .await
        .unwrap();
    // Two votes in: 0.6 total weight, third voice still pending.
    let pending = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(pending.consensus, None);

    engine
        .submit_opinion(&issue.id, "model-c", &tok_c, OpinionAction::FixRequired, "agree", None, Some(0.3))
        .await
        .unwrap();

    // 0.9 < T, but 3-0 with every voice heard decides.
    let decided = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(decided.consensus, Some(true));
    assert_eq!(decided.consensus_type, ConsensusType::FixRequired);
}

/// Scenario 5: fix, dispute, refix, accept.
#[tokio::test]
async fn fix_verify_loop_runs_two_rounds() {
    let (repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    let issue = engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("off-by-one in loop", Severity::High, "src/loop.rs", 3, 5),
        )
        .await
        .unwrap();
    engine.submit_summary(&sid, "model-a", &tok_a, "one issue").await.unwrap();
    engine.submit_summary(&sid, "model-b", &tok_b, "clean").await.unwrap();
    engine
        .submit_opinion(&issue.id, "model-b", &tok_b, OpinionAction::FixRequired, "confirmed", None, Some(1.0))
        .await
        .unwrap();

    // Deliberation is settled; processing moves the session to fixing.
    engine.process_turn(&sid).await.unwrap();
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Fixing);

    engine
        .set_issue_status(&issue.id, "model-a", &tok_a, ProgressStatus::Fixed, "patched")
        .await
        .unwrap();
    let commit = add_fix_commit(repo.path());
    engine.fix_complete(&sid, &commit, &[issue.id.clone()]).await.unwrap();
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Verifying);

    // The raiser can pull the fix delta against the previous head.
    let delta = engine.verification_delta(&sid, &[]).unwrap();
    assert!(delta.contains("src/loop.rs"));

    // Raiser disputes: round 1, back to fixing.
    engine
        .respond(&issue.id, "model-a", &tok_a, RespondAction::Dispute, "still wrong")
        .await
        .unwrap();
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Fixing);
    assert_eq!(session.verify_round, 1);

    // Second round: refix and accept.
    let commit = add_fix_commit(repo.path());
    engine.fix_complete(&sid, &commit, &[issue.id.clone()]).await.unwrap();
    engine
        .respond(&issue.id, "model-a", &tok_a, RespondAction::Accept, "fixed now")
        .await
        .unwrap();

    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Complete);
    let done = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(done.progress_status, ProgressStatus::Completed);
}

/// Scenario 6: a crashed reviewer never stalls the phase.
#[tokio::test]
async fn reviewer_crash_does_not_stall() {
    let repo = setup_review_repo();
    let storage = TempDir::new().unwrap();
    // model-b dies instantly with no submission; everyone else parks.
    let binary = fake_agent_binary(
        storage.path(),
        "if [ \"$ARV_MODEL\" = \"model-b\" ]; then exit 1; fi\nsleep 60",
    );
    let engine = test_engine(storage.path(), Some(binary));
    let sid = engine
        .create_session(create_request(
            repo.path(),
            vec![
                agent("model-a", Strictness::Strict),
                agent("model-b", Strictness::Balanced),
            ],
        ))
        .await
        .unwrap();
    engine.start(&sid).await.unwrap();

    wait_for(
        &engine,
        &sid,
        |s| s.agent("model-b").unwrap().status == AgentStatus::Failed,
        "model-b failure",
    )
    .await;

    let tok_a = token_for(&engine, &sid, "model-a");
    engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("off-by-one in loop", Severity::High, "src/loop.rs", 3, 5),
        )
        .await
        .unwrap();
    engine.submit_summary(&sid, "model-a", &tok_a, "one issue").await.unwrap();

    wait_for(&engine, &sid, |s| s.phase == Phase::Deliberating, "deliberation").await;

    let session = engine.store.load_session(&sid).unwrap();
    let crashed = session.agent("model-b").unwrap();
    assert_eq!(crashed.status, AgentStatus::Failed);
    assert!(crashed.failure_reason.is_some());

    // The crashed reviewer contributed an empty review; the survivor's issue
    // went through dedup and numbering normally.
    let reviews = engine.store.load_reviews(&sid).unwrap();
    assert!(reviews.iter().any(|r| r.model_id == "model-b" && r.summary.is_empty()));
    let issues = engine.issues_snapshot(&sid).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].display_number, Some(1));
}

// --- Boundary behaviors (§ edge rules) ---

#[tokio::test]
async fn reversed_line_range_is_normalized() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let mut req = report("reversed range report", Severity::Low, "src/loop.rs", 1, 1);
    req.line_start = Some(12);
    req.line_end = Some(10);
    let issue = engine.report_issue(&sid, "model-a", &tok_a, req).await.unwrap();
    assert_eq!(issue.line_start, Some(10));
    assert_eq!(issue.line_end, Some(12));
}

#[tokio::test]
async fn duplicate_submission_from_one_reviewer_collapses() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    for _ in 0..2 {
        engine
            .report_issue(
                &sid,
                "model-a",
                &tok_a,
                report("stale cache read", Severity::Medium, "src/parse.go", 20, 20),
            )
            .await
            .unwrap();
    }
    engine.submit_summary(&sid, "model-a", &tok_a, "done").await.unwrap();
    engine.submit_summary(&sid, "model-b", &tok_b, "done").await.unwrap();

    let issues = engine.issues_snapshot(&sid).unwrap();
    assert_eq!(issues.len(), 1);
}

#[tokio::test]
async fn role_rules_reject_invalid_actions() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    let issue = engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("off-by-one in loop", Severity::High, "src/loop.rs", 3, 5),
        )
        .await
        .unwrap();

    // The raiser cannot call its own report a false positive (I6).
    let err = engine
        .submit_opinion(&issue.id, "model-a", &tok_a, OpinionAction::FalsePositive, "oops", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    // Nobody but the raiser may withdraw (I6).
    let err = engine
        .submit_opinion(&issue.id, "model-b", &tok_b, OpinionAction::Withdraw, "not mine", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    // A wrong token is an auth failure, not a validation one.
    let err = engine
        .submit_opinion(&issue.id, "model-b", &tok_a, OpinionAction::Comment, "x", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "auth");
}

#[tokio::test]
async fn finish_during_reviewing_is_a_state_conflict() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let err = engine.finish(&sid, false).await.unwrap_err();
    assert_eq!(err.kind(), "state");
    assert_eq!(err.http_status(), 409);

    // Force bypasses the gate entirely and stops the reviewers.
    engine.finish(&sid, true).await.unwrap();
    let session = engine.store.load_session(&sid).unwrap();
    assert_eq!(session.phase, Phase::Complete);
}

#[tokio::test]
async fn human_opinion_rides_the_assist_token() {
    let (_repo, _storage, engine, sid) = started_session(vec![
        agent("model-a", Strictness::Strict),
        agent("model-b", Strictness::Balanced),
    ])
    .await;
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    let issue = engine
        .report_issue(
            &sid,
            "model-a",
            &tok_a,
            report("off-by-one in loop", Severity::High, "src/loop.rs", 3, 5),
        )
        .await
        .unwrap();
    engine.submit_summary(&sid, "model-a", &tok_a, "one").await.unwrap();
    engine.submit_summary(&sid, "model-b", &tok_b, "clean").await.unwrap();

    // Assist transcript stays off the consensus thread.
    let (messages, cli_command) = engine
        .assist_message(&issue.id, "is this severity right?")
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(cli_command.contains(&issue.id));
    let untouched = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(untouched.opinions.len(), 1); // just the raise

    // Converted into an opinion it counts, under the assist token.
    let assist_token = engine.assist_token(&sid).await.unwrap();
    let err = engine
        .assist_opinion(&issue.id, "wrong-token", OpinionAction::Comment, "hm", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "auth");
    engine
        .assist_opinion(&issue.id, &assist_token, OpinionAction::Comment, "looks real", None)
        .await
        .unwrap();
    let after = engine.store.load_issue(&sid, &issue.id).unwrap();
    assert_eq!(after.opinions.len(), 2);
    assert_eq!(after.opinions[1].model_id, "human");
}
