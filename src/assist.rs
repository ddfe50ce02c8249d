use chrono::Utc;

use crate::auth::HUMAN_MODEL_ID;
use crate::error::{Error, Result};
use crate::lifecycle::Engine;
use crate::model::{
    AssistMessage, AssistRole, ConsensusType, Issue, OpinionAction, Severity,
};

/// Build the helper's reply for an assist turn. The helper model proper is an
/// external collaborator; the engine answers with a deterministic digest of
/// the issue state so the transcript is always useful on its own.
pub fn build_reply(issue: &Issue, message: &str) -> String {
    let range = match (issue.line_start, issue.line_end) {
        (Some(s), Some(e)) if s == e => format!(":{s}"),
        (Some(s), Some(e)) => format!(":{s}-{e}"),
        _ => String::new(),
    };
    let votes = issue
        .opinions
        .iter()
        .filter(|o| o.action.is_vote())
        .count();
    let verdict = match issue.consensus_type {
        ConsensusType::Undecided => "no consensus yet".to_string(),
        other => format!("consensus: {other}"),
    };
    let mut reply = format!(
        "Issue #{num} \"{title}\" ({severity}) at {file}{range}: {verdict}, \
         {votes} vote(s) on the thread.\n\nRaised by {raiser}: {description}",
        num = issue
            .display_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string()),
        title = issue.title,
        severity = issue.severity,
        file = issue.file,
        raiser = issue.raised_by,
        description = issue.description,
    );
    if let Some(suggestion) = &issue.suggestion {
        reply.push_str(&format!("\n\nSuggested fix: {suggestion}"));
    }
    reply.push_str(&format!(
        "\n\nRegarding \"{message}\": weigh the thread above, then submit a \
         human opinion with the command below if you want it counted."
    ));
    reply
}

/// CLI command hint surfaced with every assist reply.
pub fn cli_hint(issue: &Issue) -> String {
    format!(
        "arv opinion --issue {} --action comment --reasoning \"<your take>\"",
        issue.id
    )
}

impl Engine {
    /// Append a user turn to an issue's assist transcript and answer it.
    /// Transcripts live beside the issue and never touch consensus.
    pub async fn assist_message(
        &self,
        iid: &str,
        message: &str,
    ) -> Result<(Vec<AssistMessage>, String)> {
        let (sid, _) = self
            .store
            .find_issue(iid)?
            .ok_or_else(|| Error::NotFound(format!("issue {iid}")))?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut issue = self.store.load_issue(&sid, iid)?;
        issue.assist.push(AssistMessage {
            role: AssistRole::User,
            content: message.to_string(),
            timestamp: Utc::now(),
        });
        let reply = build_reply(&issue, message);
        issue.assist.push(AssistMessage {
            role: AssistRole::Assistant,
            content: reply,
            timestamp: Utc::now(),
        });
        issue.updated_at = Utc::now();
        self.store.save_issue(&sid, &issue)?;
        Ok((issue.assist.clone(), cli_hint(&issue)))
    }

    /// Convert an assist conversation into a synthetic opinion from the
    /// `human` pseudo-reviewer. Requires the session's assist token.
    pub async fn assist_opinion(
        &self,
        iid: &str,
        token: &str,
        action: OpinionAction,
        reasoning: &str,
        suggested_severity: Option<Severity>,
    ) -> Result<Issue> {
        if !matches!(
            action,
            OpinionAction::Comment | OpinionAction::FixRequired | OpinionAction::NoFix
        ) {
            return Err(Error::Validation(format!(
                "assist opinions are comment, fix_required, or no_fix, got {action}"
            )));
        }
        self.submit_opinion(
            iid,
            HUMAN_MODEL_ID,
            token,
            action,
            reasoning,
            suggested_severity,
            None,
        )
        .await
    }
}
