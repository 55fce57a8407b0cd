//! External code-generation assistant.
//!
//! The resolver only needs "prompt in, candidate file body out". The
//! `CommandAssistant` runs a headless CLI (by default `claude -p <prompt>`)
//! and hands back its trimmed stdout; judging that output is the prose
//! classifier's job, not this module's.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{DEFAULT_ASSISTANT_COMMAND, DEFAULT_ASSISTANT_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_trace, mlog_warn};

#[async_trait]
pub trait CodeAssistant: Send + Sync {
    /// Run `prompt` with `cwd` as the working directory and return the
    /// trimmed standard output.
    async fn generate(&self, prompt: &str, cwd: &Path) -> Result<String>;
}

/// Runs an assistant CLI as a subprocess, one call per prompt.
#[derive(Debug, Clone)]
pub struct CommandAssistant {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAssistant {
    /// Build from a command line such as `claude --model sonnet`. The
    /// program is looked up on PATH; `-p <prompt>` is appended per call.
    pub fn from_command(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::AssistantNotAvailable("empty command".to_string()))?;
        let binary =
            which::which(program).map_err(|_| Error::AssistantNotAvailable(program.to_string()))?;
        Ok(Self {
            binary,
            args: parts.map(String::from).collect(),
            timeout: Duration::from_secs(DEFAULT_ASSISTANT_TIMEOUT_SECS),
        })
    }

    pub fn new() -> Result<Self> {
        Self::from_command(DEFAULT_ASSISTANT_COMMAND)
    }

    /// Use a specific binary, skipping the PATH lookup.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_ASSISTANT_TIMEOUT_SECS),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CodeAssistant for CommandAssistant {
    async fn generate(&self, prompt: &str, cwd: &Path) -> Result<String> {
        mlog_debug!(
            "CommandAssistant::generate binary={} prompt_len={}",
            self.binary.display(),
            prompt.len()
        );
        mlog_trace!("Assistant prompt:\n{}", prompt);

        // kill_on_drop reaps the child when the timeout drops the future
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(&self.args)
                .arg("-p")
                .arg(prompt)
                .current_dir(cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| Error::Assistant(format!("{}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            mlog_warn!(
                "Assistant exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        mlog_trace!("Assistant output:\n{}", stdout);
        Ok(stdout)
    }
}
