use std::{collections::BTreeMap, fmt::Write, path::Path};

use serde_json::Value;

use crate::error::JobError;

/// Everything a materializer may consult when rendering a job script.
pub struct ScriptContext<'a> {
    pub repo: &'a Value,
    pub env: &'a BTreeMap<String, String>,
    pub workspace: &'a Path,
    pub local_repo: &'a Path,
    pub init_script: &'a str,
}

/// Turns a job's declarative `repo` description into script text.
pub trait ScriptMaterializer: Send + Sync {
    fn render(&self, ctx: &ScriptContext<'_>) -> Result<String, JobError>;
}

/// Renders a bash script that exports the job env and then either runs the
/// inline `script` from the repo payload, or clones `url` (optionally at
/// `branch`) and runs its init script inside the workspace.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellMaterializer;

impl ScriptMaterializer for ShellMaterializer {
    fn render(&self, ctx: &ScriptContext<'_>) -> Result<String, JobError> {
        let mut script = String::from("#!/bin/bash\n");
        for (key, value) in ctx.env {
            if !is_env_name(key) {
                return Err(JobError::BadRequest(format!(
                    "invalid environment variable name {:?}",
                    key
                )));
            }
            let _ = writeln!(script, "export {}={}", key, shell_words::quote(value));
        }
        let workspace = shell_words::quote(&ctx.workspace.to_string_lossy()).into_owned();

        if let Some(inline) = ctx.repo.get("script").and_then(Value::as_str) {
            let _ = writeln!(script, "cd {}", workspace);
            script.push_str(inline);
            if !inline.ends_with('\n') {
                script.push('\n');
            }
            return Ok(script);
        }

        let url = ctx.repo.get("url").and_then(Value::as_str).ok_or_else(|| {
            JobError::BadRequest("repo needs either \"script\" or \"url\"".to_string())
        })?;
        let init_script = ctx
            .repo
            .get("init_script")
            .and_then(Value::as_str)
            .unwrap_or(ctx.init_script);
        let local_repo = shell_words::quote(&ctx.local_repo.to_string_lossy()).into_owned();

        script.push_str("set -e\n");
        let mut clone = vec!["git", "clone", "--depth", "1"];
        if let Some(branch) = ctx.repo.get("branch").and_then(Value::as_str) {
            clone.push("--branch");
            clone.push(branch);
        }
        clone.push(url);
        let _ = writeln!(script, "{} {}", shell_words::join(clone), local_repo);
        let _ = writeln!(script, "cd {}", workspace);
        let _ = writeln!(
            script,
            "bash {}/{}",
            local_repo,
            shell_words::quote(init_script)
        );
        Ok(script)
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
