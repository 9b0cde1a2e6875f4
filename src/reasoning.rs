//! Reasoning Adapter
//!
//! CLI-backed implementation of `ReasoningClient`: runs the configured
//! command as a subprocess with the prompt on stdin and reads the reply
//! from stdout. A hard timeout bounds every call; a busy session is
//! retried once; rate-limit phrasing in the failure output is surfaced
//! as a retryable error.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::types::ReasoningClient;

const BUSY_RETRY_DELAY_SECS: u64 = 3;

pub struct CommandReasoning {
    command: String,
    default_model: String,
    timeout_secs: u64,
}

impl CommandReasoning {
    pub fn new(command: &str, default_model: &str, timeout_secs: u64) -> Self {
        Self {
            command: command.to_string(),
            default_model: default_model.to_string(),
            timeout_secs,
        }
    }

    async fn run_once(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        session_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, AgentError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg("--model")
            .arg(model.unwrap_or(&self.default_model));
        if let Some(system) = system_prompt {
            cmd.arg("--append-system-prompt").arg(system);
        }
        if let Some(session) = session_id {
            cmd.arg("--session-id").arg(session);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::external(format!("failed to spawn {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| AgentError::external(format!("failed to write prompt: {e}")))?;
        }

        let output = timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| {
                AgentError::external(format!(
                    "reasoning call timed out after {}s",
                    self.timeout_secs
                ))
            })?
            .map_err(|e| AgentError::external(format!("reasoning subprocess failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            if is_rate_limit_text(&detail) {
                return Err(AgentError::rate_limited(format!(
                    "reasoning backend rate limited: {detail}"
                )));
            }
            return Err(AgentError::external(format!(
                "reasoning command exited with {}: {detail}",
                output.status
            )));
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(AgentError::external("reasoning command produced no output"));
        }
        debug!(len = reply.len(), "reasoning reply received");
        Ok(reply)
    }
}

fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded")
}

fn is_busy_session_text(text: &str) -> bool {
    text.to_lowercase().contains("already in use")
}

#[async_trait]
impl ReasoningClient for CommandReasoning {
    async fn execute(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        session_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, AgentError> {
        match self.run_once(message, system_prompt, session_id, model).await {
            Err(AgentError::ExternalCall { message: ref detail, .. })
                if is_busy_session_text(detail) && session_id.is_some() =>
            {
                // A lingering session from a previous run; give it a moment
                // and retry once without the session binding.
                warn!("reasoning session busy, retrying without session");
                tokio::time::sleep(Duration::from_secs(BUSY_RETRY_DELAY_SECS)).await;
                self.run_once(message, system_prompt, None, model).await
            }
            other => other,
        }
    }
}
