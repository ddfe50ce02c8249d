use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::auth::TokenSet;
use crate::error::{Error, Result};
use crate::model::{Issue, Preset, Review, Session};

/// Durable key-value storage keyed by session ID.
///
/// Layout under the storage root:
///   sessions/{sid}/session.json
///   sessions/{sid}/issues/{iid}.json
///   sessions/{sid}/reviews.json
///   sessions/{sid}/tokens.json
///   presets.json
///
/// Every write is atomic (temp file + fsync + rename); a crash mid-write
/// leaves the prior state intact. Cross-entity consistency is the lifecycle
/// controller's job, enforced by the per-session lock.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn session_dir(&self, sid: &str) -> PathBuf {
        self.sessions_dir().join(sid)
    }

    fn session_file(&self, sid: &str) -> PathBuf {
        self.session_dir(sid).join("session.json")
    }

    fn issues_dir(&self, sid: &str) -> PathBuf {
        self.session_dir(sid).join("issues")
    }

    fn issue_file(&self, sid: &str, iid: &str) -> PathBuf {
        self.issues_dir(sid).join(format!("{iid}.json"))
    }

    fn reviews_file(&self, sid: &str) -> PathBuf {
        self.session_dir(sid).join("reviews.json")
    }

    fn tokens_file(&self, sid: &str) -> PathBuf {
        self.session_dir(sid).join("tokens.json")
    }

    fn presets_file(&self) -> PathBuf {
        self.root.join("presets.json")
    }

    // --- Sessions ---

    pub fn save_session(&self, session: &Session) -> Result<()> {
        self.write_json(&self.session_file(&session.id), session)
    }

    pub fn load_session(&self, sid: &str) -> Result<Session> {
        self.read_json(&self.session_file(sid))?
            .ok_or_else(|| Error::NotFound(format!("session {sid}")))
    }

    pub fn session_exists(&self, sid: &str) -> bool {
        self.session_file(sid).exists()
    }

    /// All sessions, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let sid = entry.file_name().to_string_lossy().to_string();
            match self.read_json::<Session>(&self.session_file(&sid)) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(session_id = %sid, error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub fn delete_session(&self, sid: &str) -> Result<()> {
        let dir = self.session_dir(sid);
        if !dir.exists() {
            return Err(Error::NotFound(format!("session {sid}")));
        }
        std::fs::remove_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("failed to delete session {sid}: {e}")))
    }

    // --- Issues ---

    pub fn save_issue(&self, sid: &str, issue: &Issue) -> Result<()> {
        self.write_json(&self.issue_file(sid, &issue.id), issue)
    }

    pub fn load_issue(&self, sid: &str, iid: &str) -> Result<Issue> {
        self.read_json(&self.issue_file(sid, iid))?
            .ok_or_else(|| Error::NotFound(format!("issue {iid}")))
    }

    pub fn delete_issue(&self, sid: &str, iid: &str) -> Result<()> {
        let path = self.issue_file(sid, iid);
        if !path.exists() {
            return Err(Error::NotFound(format!("issue {iid}")));
        }
        std::fs::remove_file(&path)
            .map_err(|e| Error::Storage(format!("failed to delete issue {iid}: {e}")))
    }

    /// Issues of a session in insertion order.
    pub fn list_issues(&self, sid: &str) -> Result<Vec<Issue>> {
        let dir = self.issues_dir(sid);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut issues = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_json::<Issue>(&path) {
                Ok(Some(issue)) => issues.push(issue),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable issue"),
            }
        }
        issues.sort_by_key(|i| i.seq);
        Ok(issues)
    }

    /// Locate an issue by ID across all sessions. Issue IDs are unique per
    /// session and minted from UUIDs, so the first match wins.
    pub fn find_issue(&self, iid: &str) -> Result<Option<(String, Issue)>> {
        for session in self.list_sessions()? {
            let path = self.issue_file(&session.id, iid);
            if path.exists()
                && let Some(issue) = self.read_json::<Issue>(&path)?
            {
                return Ok(Some((session.id, issue)));
            }
        }
        Ok(None)
    }

    // --- Reviews ---

    pub fn save_reviews(&self, sid: &str, reviews: &[Review]) -> Result<()> {
        self.write_json(&self.reviews_file(sid), &reviews)
    }

    /// Reviews ordered by (turn, submitted_at); ties keep append order.
    pub fn load_reviews(&self, sid: &str) -> Result<Vec<Review>> {
        let mut reviews: Vec<Review> = self.read_json(&self.reviews_file(sid))?.unwrap_or_default();
        reviews.sort_by(|a, b| {
            a.turn
                .cmp(&b.turn)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        Ok(reviews)
    }

    // --- Tokens ---

    pub fn save_tokens(&self, sid: &str, tokens: &TokenSet) -> Result<()> {
        self.write_json(&self.tokens_file(sid), tokens)
    }

    pub fn load_tokens(&self, sid: &str) -> Result<TokenSet> {
        self.read_json(&self.tokens_file(sid))?
            .ok_or_else(|| Error::NotFound(format!("tokens for session {sid}")))
    }

    // --- Presets (process-wide) ---

    pub fn save_presets(&self, presets: &[Preset]) -> Result<()> {
        self.write_json(&self.presets_file(), &presets)
    }

    pub fn load_presets(&self) -> Result<Vec<Preset>> {
        Ok(self.read_json(&self.presets_file())?.unwrap_or_default())
    }

    // --- Plumbing ---

    fn write_json<T: Serialize>(&self, dest: &Path, value: &T) -> Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Storage(format!("no parent dir for {}", dest.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", parent.display())))?;

        let content = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Storage(format!("failed to serialize {}: {e}", dest.display())))?;

        let file_name = dest
            .file_name()
            .ok_or_else(|| Error::Storage(format!("no file name in {}", dest.display())))?;
        let tmp = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", tmp.display())))?;
        file.write_all(&content)
            .map_err(|e| Error::Storage(format!("failed to write {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("failed to fsync {}: {e}", tmp.display())))?;

        std::fs::rename(&tmp, dest)
            .map_err(|e| Error::Storage(format!("failed to rename into {}: {e}", dest.display())))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("failed to read {}: {e}", path.display())))?;
        let value = serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("failed to parse {}: {e}", path.display())))?;
        Ok(Some(value))
    }
}
