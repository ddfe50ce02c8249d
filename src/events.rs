use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{AgentStatus, ConsensusType, OpinionAction, Phase, ProgressStatus, Severity};

/// Channel capacity per session. Lagging subscribers observe drop-oldest;
/// SSE clients recover by refetching a snapshot (the server never replays).
const CHANNEL_CAPACITY: usize = 256;

/// Typed event kinds broadcast per session (C8). Serialized form is the SSE
/// `data:` payload; `kind_str` is the SSE event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChange {
        phase: Phase,
        turn: u32,
    },
    ReviewSubmitted {
        model_id: String,
        turn: u32,
        issues_raised: u32,
    },
    OpinionSubmitted {
        issue_id: String,
        model_id: String,
        action: OpinionAction,
        turn: u32,
    },
    IssueCreated {
        issue_id: String,
        display_number: Option<u32>,
        title: String,
        severity: Severity,
        raised_by: String,
    },
    IssueStatusChanged {
        issue_id: String,
        consensus_type: ConsensusType,
        progress_status: ProgressStatus,
    },
    AgentStatus {
        model_id: String,
        status: AgentStatus,
    },
    AgentActivity {
        model_id: String,
        description: String,
        timestamp: DateTime<Utc>,
    },
    AgentConfigChanged {
        model_id: String,
    },
}

impl SessionEvent {
    /// SSE event name for this kind.
    pub fn kind_str(&self) -> &'static str {
        match self {
            SessionEvent::PhaseChange { .. } => "phase_change",
            SessionEvent::ReviewSubmitted { .. } => "review_submitted",
            SessionEvent::OpinionSubmitted { .. } => "opinion_submitted",
            SessionEvent::IssueCreated { .. } => "issue_created",
            SessionEvent::IssueStatusChanged { .. } => "issue_status_changed",
            SessionEvent::AgentStatus { .. } => "agent_status",
            SessionEvent::AgentActivity { .. } => "agent_activity",
            SessionEvent::AgentConfigChanged { .. } => "agent_config_changed",
        }
    }
}

/// In-process pub/sub broker: one bounded broadcast channel per session.
/// Publishing never blocks and never depends on subscriber presence.
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, session_id: &str) -> broadcast::Sender<SessionEvent> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish to a session's channel. A send with no subscribers is fine.
    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        let _ = self.sender(session_id).send(event);
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.sender(session_id).subscribe()
    }

    /// Drop a session's channel after delete; existing subscribers see the
    /// stream end.
    pub fn remove(&self, session_id: &str) {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        channels.remove(session_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
