use serde_json::{Value, json};

use crate::cli::{ClientArgs, Command};
use crate::error::{Error, Result};

/// Thin REST client behind every `arv` verb. Agent verbs authenticate with
/// `ARV_KEY` and claim `ARV_MODEL`; operator verbs talk to `ARV_HOST`.
pub struct ArvClient {
    base: Option<String>,
    host: String,
    key: Option<String>,
    model: Option<String>,
    session: Option<String>,
}

impl ArvClient {
    pub fn new(args: &ClientArgs) -> Self {
        Self {
            base: args.base.clone(),
            host: args.host.trim_end_matches('/').to_string(),
            key: args.key.clone(),
            model: args.model.clone(),
            session: args.session.clone(),
        }
    }

    /// Per-session API root: `ARV_BASE` when handed to a reviewer, otherwise
    /// derived from the host and the selected (or activated) session.
    fn session_base(&self) -> String {
        match &self.base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => {
                let sid = self.session.as_deref().unwrap_or("current");
                format!("{}/api/sessions/{sid}", self.host)
            }
        }
    }

    /// Server root for issue-scoped routes, derived from the session base.
    fn server_root(&self) -> String {
        match &self.base {
            Some(base) => match base.find("/api/") {
                Some(idx) => base[..idx].to_string(),
                None => base.trim_end_matches('/').to_string(),
            },
            None => self.host.clone(),
        }
    }

    fn key(&self) -> Result<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| Error::Auth("ARV_KEY is not set".to_string()))
    }

    fn model(&self) -> Result<&str> {
        self.model
            .as_deref()
            .ok_or_else(|| Error::Validation("ARV_MODEL is not set".to_string()))
    }

    fn get(&self, url: &str) -> Result<Value> {
        let response = ureq::get(url).call().map_err(map_http_error)?;
        response
            .into_json()
            .map_err(|e| Error::Api(format!("invalid response from {url}: {e}")))
    }

    fn post(&self, url: &str, body: Value, key: Option<&str>) -> Result<Value> {
        let mut request = ureq::post(url).set("Content-Type", "application/json");
        if let Some(key) = key {
            request = request.set("X-Agent-Key", key);
        }
        let response = request.send_json(&body).map_err(map_http_error)?;
        response
            .into_json()
            .map_err(|e| Error::Api(format!("invalid response from {url}: {e}")))
    }

    fn delete(&self, url: &str) -> Result<Value> {
        let response = ureq::delete(url).call().map_err(map_http_error)?;
        response
            .into_json()
            .map_err(|e| Error::Api(format!("invalid response from {url}: {e}")))
    }
}

fn map_http_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response
                .into_json::<Value>()
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| format!("http {code}"));
            match code {
                403 => Error::Auth(body),
                404 => Error::NotFound(body),
                409 => Error::Conflict(body),
                400 | 422 => Error::Validation(body),
                _ => Error::Api(body),
            }
        }
        ureq::Error::Transport(t) => Error::Api(format!("transport error: {t}")),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

/// Execute one client verb against the server.
pub fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve(_) => unreachable!("serve is handled by the server entry"),

        Command::Sessions(args) => {
            let client = ArvClient::new(&args);
            let url = format!("{}/api/sessions", client.host);
            print_json(&client.get(&url)?);
        }

        Command::Create {
            client: args,
            repo,
            base,
            head,
            presets,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/api/sessions", client.host);
            let body = json!({
                "repo_path": repo,
                "base": base,
                "head": head,
                "preset_ids": presets,
            });
            print_json(&client.post(&url, body, None)?);
        }

        Command::Start(args) => {
            let client = ArvClient::new(&args);
            let url = format!("{}/start", client.session_base());
            print_json(&client.post(&url, json!({}), None)?);
        }

        Command::Activate(args) => {
            let client = ArvClient::new(&args);
            let url = format!("{}/activate", client.session_base());
            print_json(&client.post(&url, json!({}), None)?);
        }

        Command::Status(args) => {
            let client = ArvClient::new(&args);
            let url = format!("{}/status", client.session_base());
            print_json(&client.get(&url)?);
        }

        Command::Issues(args) => {
            let client = ArvClient::new(&args);
            let url = format!("{}/issues", client.session_base());
            print_json(&client.get(&url)?);
        }

        Command::Report {
            client: args,
            title,
            severity,
            file,
            line,
            line_start,
            line_end,
            description,
            suggestion,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/report", client.session_base());
            let body = json!({
                "model_id": client.model()?,
                "title": title,
                "severity": severity,
                "file": file,
                "line": line,
                "line_start": line_start,
                "line_end": line_end,
                "description": description,
                "suggestion": suggestion,
            });
            let key = client.key()?.to_string();
            print_json(&client.post(&url, body, Some(&key))?);
        }

        Command::Summary { client: args, text } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/summary", client.session_base());
            let body = json!({ "model_id": client.model()?, "text": text });
            let key = client.key()?.to_string();
            print_json(&client.post(&url, body, Some(&key))?);
        }

        Command::Opinion {
            client: args,
            issue,
            action,
            reasoning,
            severity,
            confidence,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/api/issues/{issue}/opinions", client.server_root());
            let body = json!({
                "model_id": client.model()?,
                "action": action,
                "reasoning": reasoning,
                "suggested_severity": severity,
                "confidence": confidence,
            });
            let key = client.key()?.to_string();
            print_json(&client.post(&url, body, Some(&key))?);
        }

        Command::Respond {
            client: args,
            issue,
            action,
            reasoning,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/api/issues/{issue}/respond", client.server_root());
            let body = json!({
                "model_id": client.model()?,
                "action": action,
                "reasoning": reasoning,
            });
            let key = client.key()?.to_string();
            print_json(&client.post(&url, body, Some(&key))?);
        }

        Command::SetStatus {
            client: args,
            issue,
            status,
            reasoning,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/api/issues/{issue}/status", client.server_root());
            let body = json!({
                "model_id": client.model()?,
                "status": status,
                "reasoning": reasoning,
            });
            let key = client.key()?.to_string();
            print_json(&client.post(&url, body, Some(&key))?);
        }

        Command::Dismiss {
            client: args,
            issue,
            reasoning,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/api/issues/{issue}/dismiss", client.server_root());
            print_json(&client.post(&url, json!({ "reasoning": reasoning }), None)?);
        }

        Command::Process(args) => {
            let client = ArvClient::new(&args);
            let url = format!("{}/process", client.session_base());
            print_json(&client.post(&url, json!({}), None)?);
        }

        Command::Finish { client: args, force } => {
            let client = ArvClient::new(&args);
            let mut url = format!("{}/finish", client.session_base());
            if force {
                url.push_str("?force=true");
            }
            print_json(&client.post(&url, json!({}), None)?);
        }

        Command::FixComplete {
            client: args,
            commit,
            issues,
        } => {
            let client = ArvClient::new(&args);
            let url = format!("{}/fix-complete", client.session_base());
            let body = json!({ "commit": commit, "issue_ids": issues });
            print_json(&client.post(&url, body, None)?);
        }

        Command::Delete(args) => {
            let client = ArvClient::new(&args);
            let url = client.session_base();
            print_json(&client.delete(&url)?);
        }
    }
    Ok(())
}

/// Process exit code for a failed verb: 3 unauthenticated, 4 conflict,
/// 2 server error, 1 anything else.
pub fn exit_code(err: &Error) -> i32 {
    match err.kind() {
        "auth" => 3,
        "conflict" | "state" => 4,
        "api" | "storage" => 2,
        _ => 1,
    }
}
