use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Mint an opaque access token. Tokens are random, never derived from
/// model IDs.
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Mint a 12-hex-character session ID.
pub fn mint_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Mint an issue ID.
pub fn mint_issue_id() -> String {
    format!("i-{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Mint an opinion ID.
pub fn mint_opinion_id() -> String {
    format!("o-{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Model ID the assist token speaks for.
pub const HUMAN_MODEL_ID: &str = "human";

/// Token-to-identity bindings for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSet {
    /// model_id → token, minted at session start.
    #[serde(default)]
    pub agents: HashMap<String, String>,
    /// Human-assist token, minted on demand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assist: Option<String>,
}

impl TokenSet {
    /// Mint one token per registered agent.
    pub fn mint_for<'a>(model_ids: impl Iterator<Item = &'a str>) -> Self {
        let agents = model_ids
            .map(|id| (id.to_string(), mint_token()))
            .collect();
        Self {
            agents,
            assist: None,
        }
    }

    pub fn token_for(&self, model_id: &str) -> Option<&str> {
        self.agents.get(model_id).map(|s| s.as_str())
    }

    /// Authorize an inbound call claiming to be `model_id`.
    pub fn verify(&self, model_id: &str, token: &str) -> Result<()> {
        match self.agents.get(model_id) {
            Some(expected) if expected == token => Ok(()),
            Some(_) => Err(Error::Auth(format!("token does not match {model_id}"))),
            None => Err(Error::Auth(format!("unknown model {model_id}"))),
        }
    }

    pub fn mint_assist(&mut self) -> String {
        let token = mint_token();
        self.assist = Some(token.clone());
        token
    }

    pub fn verify_assist(&self, token: &str) -> Result<()> {
        match &self.assist {
            Some(expected) if expected == token => Ok(()),
            _ => Err(Error::Auth("invalid assist token".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_opaque() {
        let set = TokenSet::mint_for(["a", "b"].into_iter());
        let ta = set.token_for("a").unwrap();
        let tb = set.token_for("b").unwrap();
        assert_ne!(ta, tb);
        assert_eq!(ta.len(), 32);
        assert!(ta.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_matches_claimed_identity() {
        let set = TokenSet::mint_for(["model-a", "model-b"].into_iter());
        let token_a = set.token_for("model-a").unwrap().to_string();
        assert!(set.verify("model-a", &token_a).is_ok());
        // Right token, wrong claimed identity.
        assert!(matches!(
            set.verify("model-b", &token_a),
            Err(Error::Auth(_))
        ));
        assert!(matches!(
            set.verify("model-c", &token_a),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_assist_token_minted_on_demand() {
        let mut set = TokenSet::default();
        assert!(set.verify_assist("anything").is_err());
        let token = set.mint_assist();
        assert!(set.verify_assist(&token).is_ok());
        assert!(set.verify_assist("wrong").is_err());
    }

    #[test]
    fn test_session_id_is_12_hex() {
        let sid = mint_session_id();
        assert_eq!(sid.len(), 12);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
