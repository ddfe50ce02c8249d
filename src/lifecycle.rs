use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::auth::{HUMAN_MODEL_ID, TokenSet, mint_issue_id, mint_opinion_id, mint_session_id};
use crate::config::Config;
use crate::consensus;
use crate::dedup::{self, group_key};
use crate::error::{Error, Result};
use crate::events::{EventBus, SessionEvent};
use crate::model::{
    AgentConfig, AgentStatus, ConsensusType, FixCommit, ImplementationContext, Issue, Opinion,
    OpinionAction, Phase, ProgressStatus, RespondAction, Review, Session, Severity,
    normalize_range,
};
use crate::prompts::PromptEngine;
use crate::repo::RepoReader;
use crate::runner::{self, LaunchSpec, RunnerHandle, RunnerRuntime};
use crate::store::SessionStore;

/// Alias accepted anywhere a session ID is: resolves to the activated session.
pub const CURRENT_ALIAS: &str = "current";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub repo_path: String,
    pub base: String,
    pub head: String,
    #[serde(default)]
    pub preset_ids: Vec<String>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub implementation_context: Option<ContextRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextRequest {
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub tradeoffs: Vec<String>,
    #[serde(default)]
    pub submitted_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    pub title: String,
    pub severity: Severity,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub line_start: Option<u32>,
    #[serde(default)]
    pub line_end: Option<u32>,
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Per-agent slice of the status rollup.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRollup {
    pub model_id: String,
    pub status: AgentStatus,
    pub strictness: crate::model::Strictness,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IssueCounts {
    pub total: usize,
    pub decided: usize,
    pub fix_required: usize,
    pub dismissed: usize,
    pub undecided: usize,
    pub closed: usize,
}

/// Consistent snapshot returned by the status query; no client-side defer
/// logic is ever needed.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRollup {
    pub session_id: String,
    pub repo_path: String,
    pub base: String,
    pub head: String,
    pub phase: Phase,
    pub turn: u32,
    pub verify_round: u32,
    pub counts: IssueCounts,
    pub agents: Vec<AgentRollup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation_context: Option<ImplementationContext>,
    pub reviews: Vec<Review>,
    pub fix_commits: Vec<FixCommit>,
}

/// Live reviewer state for one session, outside the store.
pub(crate) struct SessionHandle {
    /// Serializes every mutating operation on the session (C7).
    pub(crate) lock: AsyncMutex<()>,
    runners: Mutex<HashMap<String, RunnerHandle>>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            lock: AsyncMutex::new(()),
            runners: Mutex::new(HashMap::new()),
        }
    }

    fn stop_all(&self) {
        let runners = self.runners.lock().expect("runners lock poisoned");
        for handle in runners.values() {
            handle.stop();
        }
    }
}

/// The session-lifecycle engine (C7): owns the state machine, issues
/// commands to the runner, dedup, and consensus layers, and broadcasts
/// through the event bus. All mutations to one session are serialized by
/// that session's lock; no lock is held across a subprocess wait.
pub struct Engine {
    pub store: SessionStore,
    pub bus: Arc<EventBus>,
    pub config: Config,
    prompts: PromptEngine,
    handles: Mutex<HashMap<String, Arc<SessionHandle>>>,
    current: Mutex<Option<String>>,
}

impl Engine {
    pub fn new(config: Config, store: SessionStore, bus: Arc<EventBus>) -> Arc<Self> {
        let prompts = PromptEngine::new(config.prompt_dir.clone());
        Arc::new(Self {
            store,
            bus,
            config,
            prompts,
            handles: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        })
    }

    pub(crate) fn handle(&self, sid: &str) -> Arc<SessionHandle> {
        let mut handles = self.handles.lock().expect("handles lock poisoned");
        handles
            .entry(sid.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::new()))
            .clone()
    }

    /// Resolve the "current" alias to the activated session ID.
    pub fn resolve_sid(&self, sid: &str) -> Result<String> {
        if sid != CURRENT_ALIAS {
            return Ok(sid.to_string());
        }
        self.current
            .lock()
            .expect("current lock poisoned")
            .clone()
            .ok_or_else(|| Error::NotFound("no activated session".to_string()))
    }

    fn set_phase(&self, session: &mut Session, phase: Phase) -> Result<()> {
        session.phase = phase;
        session.updated_at = Utc::now();
        self.store.save_session(session)?;
        // Committed to the store before anyone hears about it.
        self.bus.publish(
            &session.id,
            SessionEvent::PhaseChange {
                phase,
                turn: session.turn,
            },
        );
        Ok(())
    }

    fn publish_agent_status(&self, sid: &str, agent: &AgentConfig) {
        self.bus.publish(
            sid,
            SessionEvent::AgentStatus {
                model_id: agent.model_id.clone(),
                status: agent.status,
            },
        );
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<String> {
        RepoReader::validate(&req.repo_path)?;
        crate::repo::validate_rev(&req.base)?;
        crate::repo::validate_rev(&req.head)?;

        let mut agents = req.agents;
        if !req.preset_ids.is_empty() {
            let presets = self.store.load_presets()?;
            for preset_id in &req.preset_ids {
                let preset = presets
                    .iter()
                    .find(|p| &p.id == preset_id)
                    .ok_or_else(|| Error::NotFound(format!("preset {preset_id}")))?;
                agents.push(preset.agent.clone());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.model_id.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate model_id in roster: {}",
                    agent.model_id
                )));
            }
        }

        let now = Utc::now();
        let session = Session {
            id: mint_session_id(),
            repo_path: req.repo_path,
            base: req.base,
            head: req.head,
            created_at: now,
            updated_at: now,
            phase: Phase::Idle,
            turn: 0,
            agents,
            context: req.implementation_context.map(|c| ImplementationContext {
                summary: c.summary,
                decisions: c.decisions,
                tradeoffs: c.tradeoffs,
                submitted_by: c.submitted_by.unwrap_or_else(|| "author".to_string()),
                submitted_at: now,
            }),
            fix_commits: vec![],
            verify_round: 0,
            next_seq: 0,
            next_display: 1,
        };

        let tokens = TokenSet::mint_for(session.agents.iter().map(|a| a.model_id.as_str()));
        self.store.save_session(&session)?;
        self.store.save_tokens(&session.id, &tokens)?;
        info!(session_id = %session.id, agents = session.agents.len(), "session created");
        Ok(session.id)
    }

    pub fn activate(&self, sid: &str) -> Result<()> {
        if !self.store.session_exists(sid) {
            return Err(Error::NotFound(format!("session {sid}")));
        }
        *self.current.lock().expect("current lock poisoned") = Some(sid.to_string());
        Ok(())
    }

    /// Begin collecting: spawn every enabled reviewer, then enter reviewing.
    pub async fn start(self: &Arc<Self>, sid: &str) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut session = self.store.load_session(&sid)?;
        if session.phase != Phase::Idle {
            return Err(Error::state(session.phase, "session already started"));
        }
        if session.enabled_agents().count() == 0 {
            return Err(Error::Validation("no enabled agents".to_string()));
        }

        self.set_phase(&mut session, Phase::Collecting)?;

        let tokens = self.store.load_tokens(&sid)?;
        let files_summary = self.files_summary(&session)?;
        let enabled: Vec<AgentConfig> = session.enabled_agents().cloned().collect();
        for agent in &enabled {
            match self.launch_reviewer(&session, agent, &tokens, &files_summary, &handle) {
                Ok(()) => {
                    let agent = session
                        .agent_mut(&agent.model_id)
                        .expect("agent is in roster");
                    agent.status = AgentStatus::Reviewing;
                    agent.reviewing_since = Some(Utc::now());
                    agent.failure_reason = None;
                }
                Err(e) => {
                    warn!(
                        session_id = %sid,
                        model_id = %agent.model_id,
                        error = %e,
                        "reviewer launch failed"
                    );
                    let agent = session
                        .agent_mut(&agent.model_id)
                        .expect("agent is in roster");
                    agent.status = AgentStatus::Failed;
                    agent.failure_reason = Some(e.to_string());
                }
            }
        }
        for agent in session.agents.clone() {
            if agent.enabled {
                self.publish_agent_status(&sid, &agent);
            }
        }

        self.set_phase(&mut session, Phase::Reviewing)?;
        self.maybe_advance_past_reviewing(&mut session)?;
        Ok(())
    }

    fn files_summary(&self, session: &Session) -> Result<String> {
        let root = PathBuf::from(&session.repo_path);
        let files = RepoReader::files(&root, &session.base, &session.head)?;
        if files.is_empty() {
            return Ok("(no changed files)".to_string());
        }
        Ok(files
            .iter()
            .map(|f| format!("{} (+{} -{})", f.path, f.additions, f.deletions))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn launch_reviewer(
        self: &Arc<Self>,
        session: &Session,
        agent: &AgentConfig,
        tokens: &TokenSet,
        files_summary: &str,
        handle: &Arc<SessionHandle>,
    ) -> Result<()> {
        let token = tokens
            .token_for(&agent.model_id)
            .ok_or_else(|| Error::Auth(format!("no token for {}", agent.model_id)))?;

        let vars = HashMap::from([
            ("model_id".to_string(), agent.model_id.clone()),
            ("base".to_string(), session.base.clone()),
            ("head".to_string(), session.head.clone()),
            ("repo_path".to_string(), session.repo_path.clone()),
            ("system_prompt".to_string(), agent.system_prompt.clone()),
            ("focus".to_string(), agent.focus.join(", ")),
            ("files_summary".to_string(), files_summary.to_string()),
        ]);
        let prompt = self.prompts.render("review", &vars)?;

        let spec = LaunchSpec {
            session_id: session.id.clone(),
            model_id: agent.model_id.clone(),
            client: agent.client,
            prompt,
            api_base: format!(
                "http://localhost:{}/api/sessions/{}",
                self.config.port, session.id
            ),
            token: token.to_string(),
            working_dir: PathBuf::from(&session.repo_path),
            deadline: Duration::from_secs(self.config.review_deadline_secs),
            grace: Duration::from_millis(self.config.stop_grace_ms),
            binary_override: self.config.agent_binary.clone(),
        };

        let runtime = Arc::new(RunnerRuntime::new(
            self.config.output_tail_bytes,
            self.config.activity_buffer,
        ));
        let (runner_handle, cancel_rx) = runner::handle_for(&agent.model_id, runtime.clone());
        handle
            .runners
            .lock()
            .expect("runners lock poisoned")
            .insert(agent.model_id.clone(), runner_handle);

        let engine = Arc::clone(self);
        let sid = session.id.clone();
        let model_id = agent.model_id.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let result = runner::run_reviewer(spec, runtime, bus, cancel_rx).await;
            engine.reviewer_terminal(&sid, &model_id, result).await;
        });
        Ok(())
    }

    /// A reviewer subprocess reached its terminal state. Resolve the agent's
    /// outcome against the store and advance the phase when everyone is done.
    pub async fn reviewer_terminal(&self, sid: &str, model_id: &str, result: runner::RunResult) {
        let handle = self.handle(sid);
        let _guard = handle.lock.lock().await;

        handle
            .runners
            .lock()
            .expect("runners lock poisoned")
            .remove(model_id);

        let mut session = match self.store.load_session(sid) {
            Ok(s) => s,
            // Session deleted while the reviewer was in flight.
            Err(_) => return,
        };

        let submitted = self
            .store
            .load_reviews(sid)
            .map(|reviews| {
                reviews
                    .iter()
                    .any(|r| r.model_id == model_id && r.turn == session.turn)
            })
            .unwrap_or(false);

        if let Some(agent) = session.agent_mut(model_id) {
            if agent.status != AgentStatus::Submitted {
                if submitted {
                    agent.status = AgentStatus::Submitted;
                } else {
                    agent.status = AgentStatus::Failed;
                    agent.failure_reason = Some(
                        result
                            .failure
                            .unwrap_or_else(|| "exited without submitting".to_string()),
                    );
                }
            }
            let agent = agent.clone();
            self.publish_agent_status(sid, &agent);
        }

        if let Err(e) = self.store.save_session(&session) {
            warn!(session_id = %sid, error = %e, "failed to persist agent outcome");
            return;
        }
        if let Err(e) = self.maybe_advance_past_reviewing(&mut session) {
            warn!(session_id = %sid, error = %e, "failed to advance past reviewing");
        }
    }

    /// Reviewing ends when every enabled reviewer is terminal; failures never
    /// block the phase. Runs dedup and opens deliberation.
    fn maybe_advance_past_reviewing(&self, session: &mut Session) -> Result<()> {
        if session.phase != Phase::Reviewing {
            return Ok(());
        }
        let all_terminal = session.enabled_agents().all(|a| {
            matches!(a.status, AgentStatus::Submitted | AgentStatus::Failed)
        });
        if !all_terminal {
            return Ok(());
        }

        // A reviewer with zero submissions counts as an empty review.
        let mut reviews = self.store.load_reviews(&session.id)?;
        let enabled: Vec<String> = session
            .enabled_agents()
            .map(|a| a.model_id.clone())
            .collect();
        for model_id in enabled {
            if !reviews
                .iter()
                .any(|r| r.model_id == model_id && r.turn == session.turn)
            {
                reviews.push(Review {
                    model_id,
                    turn: session.turn,
                    submitted_at: Utc::now(),
                    summary: String::new(),
                    issues_raised: 0,
                });
            }
        }
        self.store.save_reviews(&session.id, &reviews)?;

        self.set_phase(session, Phase::Dedup)?;
        self.run_dedup(session)?;
        session.turn = 1;
        self.set_phase(session, Phase::Deliberating)?;
        Ok(())
    }

    fn run_dedup(&self, session: &mut Session) -> Result<()> {
        let issues = self.store.list_issues(&session.id)?;
        let mut next_display = session.next_display;
        let outcome = dedup::dedup(issues, self.config.dedup_proximity, &mut next_display);
        for iid in &outcome.removed {
            self.store.delete_issue(&session.id, iid)?;
        }
        for issue in &outcome.canonical {
            self.store.save_issue(&session.id, issue)?;
        }
        session.next_display = next_display;
        self.store.save_session(session)?;
        info!(
            session_id = %session.id,
            canonical = outcome.canonical.len(),
            merged = outcome.removed.len(),
            "dedup complete"
        );
        Ok(())
    }

    /// Advance one deliberation turn (C6 turn advancement).
    pub async fn process_turn(&self, sid: &str) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut session = self.store.load_session(&sid)?;
        if session.phase != Phase::Deliberating {
            return Err(Error::state(session.phase, "process requires deliberating"));
        }

        let mut undecided = 0usize;
        for mut issue in self.store.list_issues(&sid)? {
            if issue.is_decided() || issue.is_closed() {
                continue;
            }
            if self.apply_consensus(&session, &mut issue)? {
                continue;
            }
            undecided += 1;
        }

        if undecided == 0 || session.turn >= self.config.max_turns {
            if undecided > 0 {
                info!(
                    session_id = %sid,
                    undecided,
                    "max turns reached, freezing undecided issues for the operator"
                );
            }
            let unresolved = self.unresolved_issue_ids(&sid)?;
            if !unresolved.is_empty() {
                session.verify_round = 0;
                self.set_phase(&mut session, Phase::Fixing)?;
            }
            // With nothing unresolved the author gate stays open: the
            // operator ends the session with finish.
            return Ok(());
        }

        session.turn += 1;
        session.updated_at = Utc::now();
        self.store.save_session(&session)?;
        self.bus.publish(
            &sid,
            SessionEvent::PhaseChange {
                phase: session.phase,
                turn: session.turn,
            },
        );
        Ok(())
    }

    fn unresolved_issue_ids(&self, sid: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_issues(sid)?
            .into_iter()
            .filter(|i| {
                i.blocks_finish() || (!i.is_decided() && !i.is_closed())
            })
            .map(|i| i.id)
            .collect())
    }

    /// Finish the session. Unresolved issues gate the transition unless
    /// forced; force also stops any live reviewers.
    pub async fn finish(&self, sid: &str, force: bool) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut session = self.store.load_session(&sid)?;
        if session.phase == Phase::Complete {
            return Ok(());
        }

        if force {
            // Force bypasses every gate and reaps any live reviewers.
            handle.stop_all();
        } else {
            if matches!(
                session.phase,
                Phase::Idle | Phase::Collecting | Phase::Reviewing | Phase::Dedup
            ) {
                return Err(Error::state(session.phase, "session is not reviewable yet"));
            }
            let unresolved = self.unresolved_issue_ids(&sid)?;
            if !unresolved.is_empty() {
                return Err(Error::Unresolved(unresolved));
            }
        }

        self.set_phase(&mut session, Phase::Complete)?;
        Ok(())
    }

    /// Record a fix commit and hand the delta to the raisers (C7 fix gate).
    pub async fn fix_complete(
        &self,
        sid: &str,
        commit: &str,
        issue_ids: &[String],
    ) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut session = self.store.load_session(&sid)?;
        if session.phase != Phase::Fixing {
            return Err(Error::state(session.phase, "fix-complete requires fixing"));
        }
        crate::repo::validate_rev(commit)?;

        for iid in issue_ids {
            let mut issue = self.store.load_issue(&sid, iid)?;
            self.set_progress(
                &sid,
                &mut issue,
                ProgressStatus::Fixed,
                "author",
                "fix committed",
                session.turn,
            )?;
        }

        session.fix_commits.push(FixCommit {
            commit: commit.to_string(),
            issue_ids: issue_ids.to_vec(),
            recorded_at: Utc::now(),
            round: session.verify_round,
        });
        self.set_phase(&mut session, Phase::Verifying)?;
        Ok(())
    }

    pub async fn delete_session(&self, sid: &str) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        {
            let _guard = handle.lock.lock().await;
            handle.stop_all();
            self.store.delete_session(&sid)?;
        }
        self.handles
            .lock()
            .expect("handles lock poisoned")
            .remove(&sid);
        self.bus.remove(&sid);
        let mut current = self.current.lock().expect("current lock poisoned");
        if current.as_deref() == Some(sid.as_str()) {
            *current = None;
        }
        Ok(())
    }

    /// Boot recovery: a session stranded mid-flight with no live runners is
    /// reset to a phase it can make progress from. Late reviewer submissions
    /// with valid tokens are still accepted afterwards.
    pub fn recover(&self) -> Result<()> {
        for mut session in self.store.list_sessions()? {
            let reset = match session.phase {
                Phase::Collecting | Phase::Reviewing | Phase::Dedup => {
                    let reviews = self.store.load_reviews(&session.id)?;
                    Some(if reviews.is_empty() {
                        Phase::Reviewing
                    } else {
                        Phase::Deliberating
                    })
                }
                _ => None,
            };
            if let Some(phase) = reset {
                warn!(
                    session_id = %session.id,
                    from = %session.phase,
                    to = %phase,
                    "recovering stranded session"
                );
                for agent in session.agents.iter_mut() {
                    if agent.status == AgentStatus::Reviewing {
                        agent.status = AgentStatus::Failed;
                        agent.failure_reason = Some("orchestrator restarted".to_string());
                    }
                }
                if phase == Phase::Deliberating && session.turn == 0 {
                    session.turn = 1;
                }
                self.set_phase(&mut session, phase)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound agent calls
    // ------------------------------------------------------------------

    fn verify_agent(&self, sid: &str, model_id: &str, token: &str) -> Result<()> {
        let tokens = self.store.load_tokens(sid)?;
        tokens.verify(model_id, token)
    }

    /// A reviewer reports an issue (the only way issues are created).
    pub async fn report_issue(
        &self,
        sid: &str,
        model_id: &str,
        token: &str,
        req: ReportRequest,
    ) -> Result<Issue> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        self.verify_agent(&sid, model_id, token)?;
        let mut session = self.store.load_session(&sid)?;
        if !matches!(session.phase, Phase::Collecting | Phase::Reviewing) {
            return Err(Error::state(session.phase, "reports are closed"));
        }
        if req.title.trim().is_empty() {
            return Err(Error::Validation("title must not be empty".to_string()));
        }
        if req.severity == Severity::Dismissed {
            return Err(Error::Validation(
                "severity dismissed is not reportable".to_string(),
            ));
        }

        let (line_start, line_end) = normalize_range(req.line, req.line_start, req.line_end);
        let now = Utc::now();
        let issue = Issue {
            id: mint_issue_id(),
            display_number: None,
            seq: session.next_seq,
            title: req.title.clone(),
            severity: req.severity,
            file: req.file.clone(),
            line_start,
            line_end,
            description: req.description.clone(),
            suggestion: req.suggestion,
            raised_by: model_id.to_string(),
            turn: session.turn,
            created_at: now,
            updated_at: now,
            consensus: None,
            consensus_type: ConsensusType::Undecided,
            final_severity: None,
            progress_status: ProgressStatus::Reported,
            group_key: group_key(&req.file, &req.title),
            opinions: vec![Opinion {
                id: mint_opinion_id(),
                model_id: model_id.to_string(),
                action: OpinionAction::Raise,
                reasoning: req.description,
                suggested_severity: Some(req.severity),
                confidence: None,
                turn: session.turn,
                timestamp: now,
                previous_status: None,
                status_value: None,
            }],
            assist: vec![],
        };

        session.next_seq += 1;
        session.updated_at = now;
        self.store.save_issue(&sid, &issue)?;
        self.store.save_session(&session)?;
        self.bus.publish(
            &sid,
            SessionEvent::IssueCreated {
                issue_id: issue.id.clone(),
                display_number: issue.display_number,
                title: issue.title.clone(),
                severity: issue.severity,
                raised_by: issue.raised_by.clone(),
            },
        );
        Ok(issue)
    }

    /// A reviewer submits its round summary; at most one review per
    /// (model, turn), the latest submission wins.
    pub async fn submit_summary(
        &self,
        sid: &str,
        model_id: &str,
        token: &str,
        summary: &str,
    ) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        self.verify_agent(&sid, model_id, token)?;
        let mut session = self.store.load_session(&sid)?;
        if !matches!(session.phase, Phase::Collecting | Phase::Reviewing) {
            return Err(Error::state(session.phase, "summaries are closed"));
        }

        let issues_raised = self
            .store
            .list_issues(&sid)?
            .iter()
            .filter(|i| i.raised_by == model_id && i.turn == session.turn)
            .count() as u32;

        let mut reviews = self.store.load_reviews(&sid)?;
        reviews.retain(|r| !(r.model_id == model_id && r.turn == session.turn));
        let review = Review {
            model_id: model_id.to_string(),
            turn: session.turn,
            submitted_at: Utc::now(),
            summary: summary.to_string(),
            issues_raised,
        };
        reviews.push(review.clone());
        self.store.save_reviews(&sid, &reviews)?;

        if let Some(agent) = session.agent_mut(model_id) {
            agent.status = AgentStatus::Submitted;
            let agent = agent.clone();
            self.publish_agent_status(&sid, &agent);
        }
        self.store.save_session(&session)?;
        self.bus.publish(
            &sid,
            SessionEvent::ReviewSubmitted {
                model_id: model_id.to_string(),
                turn: review.turn,
                issues_raised,
            },
        );

        self.maybe_advance_past_reviewing(&mut session)?;
        Ok(())
    }

    fn apply_consensus(&self, session: &Session, issue: &mut Issue) -> Result<bool> {
        let outcome = consensus::evaluate(
            issue,
            &session.agents,
            self.config.consensus_threshold,
            session.turn,
        );
        if outcome.consensus != Some(true) {
            return Ok(false);
        }
        issue.consensus = Some(true);
        issue.consensus_type = outcome.consensus_type;
        issue.final_severity = outcome.final_severity;
        issue.updated_at = Utc::now();
        self.store.save_issue(&session.id, issue)?;
        self.bus.publish(
            &session.id,
            SessionEvent::IssueStatusChanged {
                issue_id: issue.id.clone(),
                consensus_type: issue.consensus_type,
                progress_status: issue.progress_status,
            },
        );
        Ok(true)
    }

    /// Submit one opinion on an issue (deliberation, withdraw, comment).
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_opinion(
        &self,
        iid: &str,
        model_id: &str,
        token: &str,
        action: OpinionAction,
        reasoning: &str,
        suggested_severity: Option<Severity>,
        confidence: Option<f64>,
    ) -> Result<Issue> {
        let (sid, _) = self
            .store
            .find_issue(iid)?
            .ok_or_else(|| Error::NotFound(format!("issue {iid}")))?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        // Human opinions ride the assist token; reviewers present their own.
        if model_id == HUMAN_MODEL_ID {
            self.store.load_tokens(&sid)?.verify_assist(token)?;
        } else {
            self.verify_agent(&sid, model_id, token)?;
        }

        let session = self.store.load_session(&sid)?;
        let mut issue = self.store.load_issue(&sid, iid)?;

        if matches!(action, OpinionAction::Raise | OpinionAction::StatusChange) {
            return Err(Error::Validation(format!(
                "action {action} cannot be submitted directly"
            )));
        }
        if let Some(c) = confidence
            && !(0.0..=1.0).contains(&c)
        {
            return Err(Error::Validation(format!(
                "confidence must be within [0,1], got {c}"
            )));
        }
        if issue.is_closed() {
            return Err(Error::state(session.phase, "issue is closed"));
        }
        if !matches!(session.phase, Phase::Reviewing | Phase::Deliberating) {
            return Err(Error::state(session.phase, "opinions are closed"));
        }
        // Role rules (I6): the raiser may withdraw but never vote its own
        // report a false positive; nobody else may withdraw.
        if action == OpinionAction::FalsePositive && model_id == issue.raised_by {
            return Err(Error::Validation(
                "raiser cannot mark own issue false_positive".to_string(),
            ));
        }
        if action == OpinionAction::Withdraw && model_id != issue.raised_by {
            return Err(Error::Validation(
                "only the raiser can withdraw".to_string(),
            ));
        }

        let opinion = Opinion {
            id: mint_opinion_id(),
            model_id: model_id.to_string(),
            action,
            reasoning: reasoning.to_string(),
            suggested_severity,
            confidence,
            turn: session.turn,
            timestamp: Utc::now(),
            previous_status: None,
            status_value: None,
        };
        issue.opinions.push(opinion);
        issue.updated_at = Utc::now();

        if action == OpinionAction::Withdraw {
            // Withdraw closes immediately; the thread is frozen (I4).
            issue.consensus = Some(true);
            issue.consensus_type = ConsensusType::Closed;
            self.store.save_issue(&sid, &issue)?;
            self.bus.publish(
                &sid,
                SessionEvent::IssueStatusChanged {
                    issue_id: issue.id.clone(),
                    consensus_type: issue.consensus_type,
                    progress_status: issue.progress_status,
                },
            );
        } else if action.is_vote() && !issue.is_decided() {
            if !self.apply_consensus(&session, &mut issue)? {
                self.store.save_issue(&sid, &issue)?;
            }
        } else {
            self.store.save_issue(&sid, &issue)?;
        }

        self.bus.publish(
            &sid,
            SessionEvent::OpinionSubmitted {
                issue_id: issue.id.clone(),
                model_id: model_id.to_string(),
                action,
                turn: session.turn,
            },
        );
        Ok(issue)
    }

    /// Raiser verdict on a fix during verification.
    pub async fn respond(
        &self,
        iid: &str,
        model_id: &str,
        token: &str,
        action: RespondAction,
        reasoning: &str,
    ) -> Result<()> {
        let (sid, _) = self
            .store
            .find_issue(iid)?
            .ok_or_else(|| Error::NotFound(format!("issue {iid}")))?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        self.verify_agent(&sid, model_id, token)?;
        let mut session = self.store.load_session(&sid)?;
        if session.phase != Phase::Verifying {
            return Err(Error::state(session.phase, "respond requires verifying"));
        }
        let mut issue = self.store.load_issue(&sid, iid)?;
        if issue.raised_by != model_id {
            return Err(Error::Validation(
                "only the raiser validates a fix".to_string(),
            ));
        }

        let verdict = match action {
            RespondAction::Accept => "accept",
            RespondAction::Dispute => "dispute",
            RespondAction::Partial => "partial",
        };
        issue.opinions.push(Opinion {
            id: mint_opinion_id(),
            model_id: model_id.to_string(),
            action: OpinionAction::StatusChange,
            reasoning: reasoning.to_string(),
            suggested_severity: None,
            confidence: None,
            turn: session.turn,
            timestamp: Utc::now(),
            previous_status: Some(issue.progress_status.to_string()),
            status_value: Some(verdict.to_string()),
        });

        match action {
            RespondAction::Accept => {
                issue.progress_status = ProgressStatus::Completed;
                issue.updated_at = Utc::now();
                self.store.save_issue(&sid, &issue)?;
                self.publish_issue_status(&sid, &issue);
                // All fixes accepted ends the session.
                if self.unresolved_issue_ids(&sid)?.is_empty() {
                    self.set_phase(&mut session, Phase::Complete)?;
                }
            }
            RespondAction::Dispute => {
                issue.progress_status = ProgressStatus::Reported;
                issue.updated_at = Utc::now();
                self.store.save_issue(&sid, &issue)?;
                self.publish_issue_status(&sid, &issue);
                if session.verify_round < self.config.max_verify_rounds {
                    session.verify_round += 1;
                    session.turn += 1;
                    self.set_phase(&mut session, Phase::Fixing)?;
                } else {
                    // Round cap: remaining open issues freeze as undecided.
                    for mut open in self.store.list_issues(&sid)? {
                        if open.blocks_finish() {
                            open.consensus_type = ConsensusType::Undecided;
                            open.consensus = None;
                            open.updated_at = Utc::now();
                            self.store.save_issue(&sid, &open)?;
                            self.publish_issue_status(&sid, &open);
                        }
                    }
                    self.set_phase(&mut session, Phase::Complete)?;
                }
            }
            RespondAction::Partial => {
                issue.updated_at = Utc::now();
                self.store.save_issue(&sid, &issue)?;
                self.publish_issue_status(&sid, &issue);
            }
        }
        Ok(())
    }

    fn publish_issue_status(&self, sid: &str, issue: &Issue) {
        self.bus.publish(
            sid,
            SessionEvent::IssueStatusChanged {
                issue_id: issue.id.clone(),
                consensus_type: issue.consensus_type,
                progress_status: issue.progress_status,
            },
        );
    }

    fn set_progress(
        &self,
        sid: &str,
        issue: &mut Issue,
        status: ProgressStatus,
        by: &str,
        reasoning: &str,
        turn: u32,
    ) -> Result<()> {
        issue.opinions.push(Opinion {
            id: mint_opinion_id(),
            model_id: by.to_string(),
            action: OpinionAction::StatusChange,
            reasoning: reasoning.to_string(),
            suggested_severity: None,
            confidence: None,
            turn,
            timestamp: Utc::now(),
            previous_status: Some(issue.progress_status.to_string()),
            status_value: Some(status.to_string()),
        });
        issue.progress_status = status;
        issue.updated_at = Utc::now();
        self.store.save_issue(sid, issue)?;
        self.publish_issue_status(sid, issue);
        Ok(())
    }

    /// Author/agent marks progress on an issue. `completed` is reserved for
    /// the verification pass (I3).
    pub async fn set_issue_status(
        &self,
        iid: &str,
        model_id: &str,
        token: &str,
        status: ProgressStatus,
        reasoning: &str,
    ) -> Result<()> {
        let (sid, _) = self
            .store
            .find_issue(iid)?
            .ok_or_else(|| Error::NotFound(format!("issue {iid}")))?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        self.verify_agent(&sid, model_id, token)?;
        let session = self.store.load_session(&sid)?;
        if status == ProgressStatus::Completed {
            return Err(Error::Validation(
                "completed is set by fix verification".to_string(),
            ));
        }
        if status == ProgressStatus::Reported {
            return Err(Error::Validation(
                "reported is the initial status".to_string(),
            ));
        }
        if !matches!(
            session.phase,
            Phase::Deliberating | Phase::Fixing | Phase::Verifying
        ) {
            return Err(Error::state(session.phase, "status changes are closed"));
        }
        let mut issue = self.store.load_issue(&sid, iid)?;
        if issue.is_closed() {
            return Err(Error::state(session.phase, "issue is closed"));
        }
        self.set_progress(&sid, &mut issue, status, model_id, reasoning, session.turn)?;
        Ok(())
    }

    /// Operator dismisses an issue outright.
    pub async fn dismiss_issue(&self, iid: &str, reasoning: &str) -> Result<()> {
        let (sid, _) = self
            .store
            .find_issue(iid)?
            .ok_or_else(|| Error::NotFound(format!("issue {iid}")))?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let session = self.store.load_session(&sid)?;
        let mut issue = self.store.load_issue(&sid, iid)?;
        if issue.is_closed() {
            return Err(Error::state(session.phase, "issue is closed"));
        }
        issue.opinions.push(Opinion {
            id: mint_opinion_id(),
            model_id: "operator".to_string(),
            action: OpinionAction::StatusChange,
            reasoning: reasoning.to_string(),
            suggested_severity: None,
            confidence: None,
            turn: session.turn,
            timestamp: Utc::now(),
            previous_status: Some(issue.consensus_type.to_string()),
            status_value: Some(ConsensusType::Dismissed.to_string()),
        });
        issue.consensus = Some(true);
        issue.consensus_type = ConsensusType::Dismissed;
        issue.updated_at = Utc::now();
        self.store.save_issue(&sid, &issue)?;
        self.publish_issue_status(&sid, &issue);
        Ok(())
    }

    /// Attach author context after creation.
    pub async fn set_context(&self, sid: &str, ctx: ContextRequest) -> Result<()> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut session = self.store.load_session(&sid)?;
        session.context = Some(ImplementationContext {
            summary: ctx.summary,
            decisions: ctx.decisions,
            tradeoffs: ctx.tradeoffs,
            submitted_by: ctx.submitted_by.unwrap_or_else(|| "author".to_string()),
            submitted_at: Utc::now(),
        });
        session.updated_at = Utc::now();
        self.store.save_session(&session)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries (snapshot reads, no session lock)
    // ------------------------------------------------------------------

    pub fn status_rollup(&self, sid: &str) -> Result<SessionRollup> {
        let sid = self.resolve_sid(sid)?;
        let session = self.store.load_session(&sid)?;
        let issues = self.store.list_issues(&sid)?;
        let reviews = self.store.load_reviews(&sid)?;
        let now = Utc::now();

        let mut counts = IssueCounts {
            total: issues.len(),
            ..Default::default()
        };
        for issue in &issues {
            match issue.consensus_type {
                ConsensusType::FixRequired => counts.fix_required += 1,
                ConsensusType::Dismissed => counts.dismissed += 1,
                ConsensusType::Undecided => counts.undecided += 1,
                ConsensusType::Closed => counts.closed += 1,
            }
            if issue.is_decided() {
                counts.decided += 1;
            }
        }

        Ok(SessionRollup {
            session_id: session.id.clone(),
            repo_path: session.repo_path.clone(),
            base: session.base.clone(),
            head: session.head.clone(),
            phase: session.phase,
            turn: session.turn,
            verify_round: session.verify_round,
            counts,
            agents: session
                .agents
                .iter()
                .map(|a| AgentRollup {
                    model_id: a.model_id.clone(),
                    status: a.status,
                    strictness: a.strictness,
                    enabled: a.enabled,
                    elapsed_secs: a.elapsed_secs(now),
                    failure_reason: a.failure_reason.clone(),
                })
                .collect(),
            implementation_context: session.context.clone(),
            reviews,
            fix_commits: session.fix_commits.clone(),
        })
    }

    pub fn issues_snapshot(&self, sid: &str) -> Result<Vec<Issue>> {
        let sid = self.resolve_sid(sid)?;
        if !self.store.session_exists(&sid) {
            return Err(Error::NotFound(format!("session {sid}")));
        }
        self.store.list_issues(&sid)
    }

    pub fn diff(&self, sid: &str, path: &str) -> Result<String> {
        let sid = self.resolve_sid(sid)?;
        let session = self.store.load_session(&sid)?;
        RepoReader::diff(
            Path::new(&session.repo_path),
            &session.base,
            &session.head,
            path,
        )
    }

    pub fn read_lines(
        &self,
        sid: &str,
        path: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<crate::repo::FileLine>> {
        let sid = self.resolve_sid(sid)?;
        let session = self.store.load_session(&sid)?;
        RepoReader::read(Path::new(&session.repo_path), &session.head, path, start, end)
    }

    /// Delta diff of the latest fix commit against the previous head, scoped
    /// to the given paths.
    pub fn verification_delta(&self, sid: &str, paths: &[String]) -> Result<String> {
        let sid = self.resolve_sid(sid)?;
        let session = self.store.load_session(&sid)?;
        let new_head = session
            .fix_commits
            .last()
            .map(|f| f.commit.clone())
            .ok_or_else(|| Error::state(session.phase, "no fix commit recorded"))?;
        let prev_head = session
            .fix_commits
            .iter()
            .rev()
            .nth(1)
            .map(|f| f.commit.as_str())
            .unwrap_or(&session.head);
        RepoReader::delta(
            Path::new(&session.repo_path),
            prev_head,
            &new_head,
            paths,
        )
    }

    /// Output tails and recent activity for one reviewer.
    pub fn runner_runtime(&self, sid: &str, model_id: &str) -> Result<Option<Arc<RunnerRuntime>>> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let runners = handle.runners.lock().expect("runners lock poisoned");
        Ok(runners.get(model_id).map(|h| h.runtime.clone()))
    }

    /// Mint (or reuse) the human-assist token for a session.
    pub async fn assist_token(&self, sid: &str) -> Result<String> {
        let sid = self.resolve_sid(sid)?;
        let handle = self.handle(&sid);
        let _guard = handle.lock.lock().await;

        let mut tokens = self.store.load_tokens(&sid)?;
        if let Some(token) = tokens.assist.clone() {
            return Ok(token);
        }
        let token = tokens.mint_assist();
        self.store.save_tokens(&sid, &tokens)?;
        Ok(token)
    }
}
