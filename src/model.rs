use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle phase (§4.7 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Collecting,
    Reviewing,
    Dedup,
    Deliberating,
    Fixing,
    Verifying,
    Complete,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Collecting => "collecting",
            Phase::Reviewing => "reviewing",
            Phase::Dedup => "dedup",
            Phase::Deliberating => "deliberating",
            Phase::Fixing => "fixing",
            Phase::Verifying => "verifying",
            Phase::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Dismissed,
}

impl Severity {
    /// Numeric rank for ordering and weighted-median computation.
    /// Higher rank means more severe.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Dismissed => 0,
        }
    }

    pub fn from_rank(rank: u8) -> Severity {
        match rank {
            4.. => Severity::Critical,
            3 => Severity::High,
            2 => Severity::Medium,
            1 => Severity::Low,
            0 => Severity::Dismissed,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Dismissed => "dismissed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Strict,
    #[default]
    Balanced,
    Lenient,
}

impl Strictness {
    /// Default vote weight when a reviewer supplies no confidence.
    pub fn weight(&self) -> f64 {
        match self {
            Strictness::Strict => 1.0,
            Strictness::Balanced => 0.7,
            Strictness::Lenient => 0.4,
        }
    }
}

/// CLI-backed engine driving a reviewer subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientKind::Claude => "claude",
            ClientKind::Codex => "codex",
            ClientKind::Gemini => "gemini",
            ClientKind::Opencode => "opencode",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Reviewing,
    Submitted,
    Failed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Reviewing => "reviewing",
            AgentStatus::Submitted => "submitted",
            AgentStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A configured reviewer bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model identifier, unique within the session.
    pub model_id: String,
    pub client: ClientKind,
    pub provider: String,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Review focus keywords injected into the reviewer prompt.
    #[serde(default)]
    pub focus: Vec<String>,
    #[serde(default)]
    pub color: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: AgentStatus,
    /// When the agent last entered `reviewing`; drives elapsed-seconds rollups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewing_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.reviewing_since
            .map(|since| (now - since).num_seconds().max(0))
    }
}

/// Session-independent template for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpinionAction {
    Raise,
    FixRequired,
    NoFix,
    FalsePositive,
    Withdraw,
    Comment,
    StatusChange,
}

impl OpinionAction {
    /// Vote-bearing actions count toward consensus; `comment` and
    /// `status_change` do not.
    pub fn is_vote(&self) -> bool {
        matches!(
            self,
            OpinionAction::FixRequired | OpinionAction::NoFix | OpinionAction::FalsePositive
        )
    }
}

impl std::fmt::Display for OpinionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpinionAction::Raise => "raise",
            OpinionAction::FixRequired => "fix_required",
            OpinionAction::NoFix => "no_fix",
            OpinionAction::FalsePositive => "false_positive",
            OpinionAction::Withdraw => "withdraw",
            OpinionAction::Comment => "comment",
            OpinionAction::StatusChange => "status_change",
        };
        write!(f, "{s}")
    }
}

/// One entry in an issue's opinion thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opinion {
    pub id: String,
    pub model_id: String,
    pub action: OpinionAction,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    FixRequired,
    Dismissed,
    #[default]
    Undecided,
    Closed,
}

impl std::fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConsensusType::FixRequired => "fix_required",
            ConsensusType::Dismissed => "dismissed",
            ConsensusType::Undecided => "undecided",
            ConsensusType::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Reported,
    WontFix,
    Fixed,
    Completed,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressStatus::Reported => "reported",
            ProgressStatus::WontFix => "wont_fix",
            ProgressStatus::Fixed => "fixed",
            ProgressStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Raiser's verdict on a fix during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespondAction {
    Accept,
    Dispute,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistMessage {
    pub role: AssistRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A problem report with a stable ID and an opinion thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// Dense 1-based number within the session, assigned once (never renumbered).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_number: Option<u32>,
    /// Per-session insertion sequence; retrieval order.
    pub seq: u64,
    pub title: String,
    pub severity: Severity,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub raised_by: String,
    pub turn: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<bool>,
    #[serde(default)]
    pub consensus_type: ConsensusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_severity: Option<Severity>,
    #[serde(default)]
    pub progress_status: ProgressStatus,
    pub group_key: String,
    #[serde(default)]
    pub opinions: Vec<Opinion>,
    #[serde(default)]
    pub assist: Vec<AssistMessage>,
}

impl Issue {
    /// Closed issues accept no further opinions (terminal).
    pub fn is_closed(&self) -> bool {
        self.consensus_type == ConsensusType::Closed
    }

    pub fn is_decided(&self) -> bool {
        self.consensus == Some(true)
    }

    /// Open fix-required issues gate `finish`.
    pub fn blocks_finish(&self) -> bool {
        self.consensus_type == ConsensusType::FixRequired
            && self.progress_status != ProgressStatus::Completed
            && self.progress_status != ProgressStatus::WontFix
    }
}

/// Normalize an inclusive line range so start ≤ end. A bare `line` stands for
/// a single-line range. Reversed input is swapped, not rejected.
pub fn normalize_range(
    line: Option<u32>,
    start: Option<u32>,
    end: Option<u32>,
) -> (Option<u32>, Option<u32>) {
    let (s, e) = match (line, start, end) {
        (_, Some(s), Some(e)) => (Some(s), Some(e)),
        (_, Some(s), None) => (Some(s), Some(s)),
        (_, None, Some(e)) => (Some(e), Some(e)),
        (Some(l), None, None) => (Some(l), Some(l)),
        (None, None, None) => (None, None),
    };
    match (s, e) {
        (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
        other => other,
    }
}

/// One reviewer's round-level record. At most one per (model_id, turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub model_id: String,
    pub turn: u32,
    pub submitted_at: DateTime<Utc>,
    pub summary: String,
    pub issues_raised: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationContext {
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub tradeoffs: Vec<String>,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixCommit {
    pub commit: String,
    #[serde(default)]
    pub issue_ids: Vec<String>,
    pub recorded_at: DateTime<Utc>,
    /// Verification round this commit belongs to (0-based).
    pub round: u32,
}

/// A single code-review job over a (base, head) pair. Aggregate root: owns
/// its issues, reviews, agents, and implementation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub repo_path: String,
    pub base: String,
    pub head: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: Phase,
    /// Zero-based deliberation turn. Turn 0 is the initial raise.
    pub turn: u32,
    pub agents: Vec<AgentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ImplementationContext>,
    #[serde(default)]
    pub fix_commits: Vec<FixCommit>,
    #[serde(default)]
    pub verify_round: u32,
    /// Next issue insertion sequence.
    #[serde(default)]
    pub next_seq: u64,
    /// Next display number to hand out.
    #[serde(default = "default_display")]
    pub next_display: u32,
}

fn default_display() -> u32 {
    1
}

impl Session {
    pub fn agent(&self, model_id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.model_id == model_id)
    }

    pub fn agent_mut(&mut self, model_id: &str) -> Option<&mut AgentConfig> {
        self.agents.iter_mut().find(|a| a.model_id == model_id)
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }

    /// Head revision the next delta diff is computed against: the last fix
    /// commit, or the original head before any fix landed.
    pub fn verify_base(&self) -> &str {
        match self.fix_commits.last() {
            Some(fix) => &fix.commit,
            None => &self.head,
        }
    }
}
