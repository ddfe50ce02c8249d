use clap::{Args, Parser, Subcommand};

/// arv — multi-agent code-review orchestrator
#[derive(Parser, Debug)]
#[command(name = "arv", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Connection settings shared by every client verb.
///
/// Agent verbs talk to the per-session API root handed to the reviewer
/// (`ARV_BASE`); operator verbs fall back to the server host (`ARV_HOST`).
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Per-session API base URL
    #[arg(long, env = "ARV_BASE")]
    pub base: Option<String>,

    /// Server host for operator verbs
    #[arg(long, env = "ARV_HOST", default_value = "http://localhost:3000")]
    pub host: String,

    /// Agent access token
    #[arg(long, env = "ARV_KEY")]
    pub key: Option<String>,

    /// Claimed model ID
    #[arg(long, env = "ARV_MODEL")]
    pub model: Option<String>,

    /// Session ID (defaults to the activated session)
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the orchestrator server
    Serve(ServeArgs),

    /// List sessions
    Sessions(ClientArgs),

    /// Create a review session
    Create {
        #[command(flatten)]
        client: ClientArgs,
        /// Path to the working tree
        #[arg(long)]
        repo: String,
        /// Base revision
        #[arg(long)]
        base: String,
        /// Head revision
        #[arg(long)]
        head: String,
        /// Preset IDs to instantiate as agents
        #[arg(long = "preset")]
        presets: Vec<String>,
    },

    /// Begin collecting reviews for a session
    Start(ClientArgs),

    /// Bind the "current" session alias
    Activate(ClientArgs),

    /// Session rollup: phase, turn, counts, per-agent state
    Status(ClientArgs),

    /// Full issues snapshot
    Issues(ClientArgs),

    /// Report an issue (reviewer verb)
    Report {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        title: String,
        /// critical|high|medium|low
        #[arg(long)]
        severity: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        line: Option<u32>,
        #[arg(long)]
        line_start: Option<u32>,
        #[arg(long)]
        line_end: Option<u32>,
        #[arg(long)]
        description: String,
        #[arg(long)]
        suggestion: Option<String>,
    },

    /// Submit a round summary (reviewer verb)
    Summary {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        text: String,
    },

    /// Submit an opinion on an issue
    Opinion {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        issue: String,
        /// fix_required|no_fix|false_positive|withdraw|comment
        #[arg(long)]
        action: String,
        #[arg(long)]
        reasoning: String,
        #[arg(long)]
        severity: Option<String>,
        /// Vote confidence in [0,1]
        #[arg(long)]
        confidence: Option<f64>,
    },

    /// Raiser verdict on a fix: accept|dispute|partial
    Respond {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        issue: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        reasoning: String,
    },

    /// Set issue progress status: fixed|wont_fix|completed
    SetStatus {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        issue: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        reasoning: String,
    },

    /// Dismiss an issue (operator verb)
    Dismiss {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        issue: String,
        #[arg(long)]
        reasoning: String,
    },

    /// Advance a deliberation turn
    Process(ClientArgs),

    /// Finish the session (409 on unresolved issues unless forced)
    Finish {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        force: bool,
    },

    /// Record a fix commit and move to verification
    FixComplete {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        commit: String,
        #[arg(long = "issue")]
        issues: Vec<String>,
    },

    /// Delete a session
    Delete(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to bind
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Storage root for persisted sessions and presets
    #[arg(long, env = "ARV_STORAGE")]
    pub storage_root: Option<String>,

    /// Path to config file
    #[arg(long, default_value = ".arv/config.toml")]
    pub config: String,
}
