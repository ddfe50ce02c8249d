use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_REVIEW: &str = include_str!("default_prompts/review.md");
const DEFAULT_DELIBERATE: &str = include_str!("default_prompts/deliberate.md");
const DEFAULT_VERIFY: &str = include_str!("default_prompts/verify.md");
const DEFAULT_CONNECTION_TEST: &str = include_str!("default_prompts/connection-test.md");

fn default_template(name: &str) -> Option<&'static str> {
    match name {
        "review" => Some(DEFAULT_REVIEW),
        "deliberate" => Some(DEFAULT_DELIBERATE),
        "verify" => Some(DEFAULT_VERIFY),
        "connection-test" => Some(DEFAULT_CONNECTION_TEST),
        _ => None,
    }
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load a prompt template by name. Overrides in `override_dir` take
    /// precedence over the embedded defaults.
    pub fn load_template(&self, name: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(format!("{name}.md"));
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                })?;
                return Ok(content);
            }
        }

        default_template(name)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt template: {name}")))
    }

    /// Load a template and render it with the given variables.
    pub fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(name)?;
        render_template(&template, vars)
    }
}

/// Render a template string using the `upon` template engine.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}
