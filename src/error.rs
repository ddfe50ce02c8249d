use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("invalid in phase {phase}: {message}")]
    State { phase: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unresolved issues block finish")]
    Unresolved(Vec<String>),

    #[error("repo error: {0}")]
    Repo(String),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("api error: {0}")]
    Api(String),
}

impl Error {
    /// Shorthand for a phase-mismatch error.
    pub fn state(phase: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Error::State {
            phase: phase.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status code for this failure kind, applied at the adapter boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_) => 403,
            Error::NotFound(_) => 404,
            Error::State { .. } | Error::Conflict(_) | Error::Unresolved(_) => 409,
            Error::Repo(_) => 422,
            _ => 500,
        }
    }

    /// Stable kind tag carried in structured responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigNotFound(_) | Error::ConfigParse(_) | Error::ConfigValidation(_) => {
                "config"
            }
            Error::Io(_) => "io",
            Error::Validation(_) => "validation",
            Error::Auth(_) => "auth",
            Error::State { .. } => "state",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) | Error::Unresolved(_) => "conflict",
            Error::Repo(_) => "repo",
            Error::Subprocess(_) => "subprocess",
            Error::Storage(_) => "storage",
            Error::Prompt(_) => "prompt",
            Error::Api(_) => "api",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::Validation("x".into()).http_status(), 400);
        assert_eq!(Error::Auth("x".into()).http_status(), 403);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            Error::state("reviewing", "finish not allowed").http_status(),
            409
        );
        assert_eq!(Error::Unresolved(vec!["i-1".into()]).http_status(), 409);
        assert_eq!(Error::Repo("outside root".into()).http_status(), 422);
        assert_eq!(Error::Storage("disk".into()).http_status(), 500);
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(Error::state("idle", "x").kind(), "state");
        assert_eq!(Error::Unresolved(vec![]).kind(), "conflict");
        assert_eq!(Error::Subprocess("spawn".into()).kind(), "subprocess");
    }
}
