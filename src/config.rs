use std::path::Path;

use serde::Deserialize;

use crate::cli::ServeArgs;
use crate::error::{Error, Result};

/// On-disk server configuration. Every field optional; CLI flags win.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub port: Option<u16>,
    pub storage_root: Option<String>,
    pub review_deadline_secs: Option<u64>,
    pub opinion_deadline_secs: Option<u64>,
    pub consensus_threshold: Option<f64>,
    pub max_turns: Option<u32>,
    pub max_verify_rounds: Option<u32>,
    pub dedup_proximity: Option<u32>,
    pub activity_buffer: Option<usize>,
    pub output_tail_bytes: Option<usize>,
    pub stop_grace_ms: Option<u64>,
    pub conntest_timeout_secs: Option<u64>,
    pub prompt_dir: Option<String>,
    pub agent_binary: Option<String>,
}

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub storage_root: String,
    /// Soft deadline for one reviewer subprocess per turn.
    pub review_deadline_secs: u64,
    /// Per-turn deadline after which a silent reviewer is skipped.
    pub opinion_deadline_secs: u64,
    /// Margin one side must win by for weighted consensus.
    pub consensus_threshold: f64,
    pub max_turns: u32,
    pub max_verify_rounds: u32,
    /// Line-range proximity window for dedup merging.
    pub dedup_proximity: u32,
    /// Activity events retained per model (drop-oldest beyond this).
    pub activity_buffer: usize,
    /// Bytes of stdout/stderr tail retained per reviewer process.
    pub output_tail_bytes: usize,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace_ms: u64,
    pub conntest_timeout_secs: u64,
    /// Prompt template override directory.
    pub prompt_dir: Option<String>,
    /// Override binary for all client kinds (testing hook).
    pub agent_binary: Option<String>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> Result<Self> {
        let path = Path::new(&args.config);
        let file_config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            parse_config(&content)?
        } else {
            ConfigFile::default()
        };
        merge(file_config, args)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

pub fn merge(file: ConfigFile, args: &ServeArgs) -> Result<Config> {
    let config = Config {
        port: if args.port != 3000 {
            args.port
        } else {
            file.port.unwrap_or(args.port)
        },
        storage_root: args
            .storage_root
            .clone()
            .or(file.storage_root)
            .unwrap_or_else(|| ".arv".to_string()),
        review_deadline_secs: file.review_deadline_secs.unwrap_or(1800),
        opinion_deadline_secs: file.opinion_deadline_secs.unwrap_or(600),
        consensus_threshold: file.consensus_threshold.unwrap_or(2.0),
        max_turns: file.max_turns.unwrap_or(3),
        max_verify_rounds: file.max_verify_rounds.unwrap_or(2),
        dedup_proximity: file.dedup_proximity.unwrap_or(5),
        activity_buffer: file.activity_buffer.unwrap_or(50),
        output_tail_bytes: file.output_tail_bytes.unwrap_or(8 * 1024),
        stop_grace_ms: file.stop_grace_ms.unwrap_or(2000),
        conntest_timeout_secs: file.conntest_timeout_secs.unwrap_or(60),
        prompt_dir: file.prompt_dir,
        agent_binary: file.agent_binary,
    };

    if config.consensus_threshold <= 0.0 {
        return Err(Error::ConfigValidation(
            "consensus_threshold must be positive".to_string(),
        ));
    }
    if config.max_turns == 0 {
        return Err(Error::ConfigValidation(
            "max_turns must be at least 1".to_string(),
        ));
    }
    if config.activity_buffer < 50 {
        return Err(Error::ConfigValidation(
            "activity_buffer must be at least 50".to_string(),
        ));
    }
    if config.output_tail_bytes < 8 * 1024 {
        return Err(Error::ConfigValidation(
            "output_tail_bytes must be at least 8192".to_string(),
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args() -> ServeArgs {
        ServeArgs {
            port: 3000,
            storage_root: None,
            config: ".arv/config.toml".to_string(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = merge(ConfigFile::default(), &serve_args()).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.storage_root, ".arv");
        assert_eq!(config.consensus_threshold, 2.0);
        assert_eq!(config.max_turns, 3);
        assert_eq!(config.max_verify_rounds, 2);
        assert_eq!(config.dedup_proximity, 5);
        assert_eq!(config.activity_buffer, 50);
        assert_eq!(config.output_tail_bytes, 8192);
        assert_eq!(config.conntest_timeout_secs, 60);
    }

    #[test]
    fn test_file_values_used_when_cli_default() {
        let file = parse_config("port = 8080\nmax_turns = 5\n").unwrap();
        let config = merge(file, &serve_args()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_turns, 5);
    }

    #[test]
    fn test_cli_port_wins_over_file() {
        let file = parse_config("port = 8080\n").unwrap();
        let mut args = serve_args();
        args.port = 4000;
        let config = merge(file, &args).unwrap();
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(parse_config("no_such_key = true\n").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let file = parse_config("consensus_threshold = 0.0\n").unwrap();
        assert!(matches!(
            merge(file, &serve_args()),
            Err(Error::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_small_buffers() {
        let file = parse_config("activity_buffer = 10\n").unwrap();
        assert!(merge(file, &serve_args()).is_err());

        let file = parse_config("output_tail_bytes = 1024\n").unwrap();
        assert!(merge(file, &serve_args()).is_err());
    }
}
