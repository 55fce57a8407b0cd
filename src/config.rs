use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::resolution::ResolverConfig;
use crate::{mlog_debug, Error, Result};

pub const DEFAULT_CANONICAL_BRANCH: &str = "main";
pub const DEFAULT_ASSISTANT_COMMAND: &str = "claude";
pub const DEFAULT_ASSISTANT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub canonical_branch: Option<String>,
    /// Enable the ai-resolve tier.
    #[serde(default)]
    pub ai_resolve: bool,
    /// Enable the reimagine tier.
    #[serde(default)]
    pub reimagine: bool,
    pub assistant_command: Option<String>,
    pub assistant_timeout_secs: Option<u64>,
    pub queue_path: Option<String>,
}

impl Config {
    pub fn mergeq_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".mergeq"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::mergeq_dir()?.join("mergeq.toml"))
    }

    pub fn effective_canonical_branch(&self) -> &str {
        self.canonical_branch
            .as_deref()
            .unwrap_or(DEFAULT_CANONICAL_BRANCH)
    }

    pub fn effective_assistant_command(&self) -> &str {
        self.assistant_command
            .as_deref()
            .unwrap_or(DEFAULT_ASSISTANT_COMMAND)
    }

    pub fn assistant_timeout(&self) -> Duration {
        Duration::from_secs(
            self.assistant_timeout_secs
                .unwrap_or(DEFAULT_ASSISTANT_TIMEOUT_SECS),
        )
    }

    pub fn queue_path(&self) -> Result<PathBuf> {
        match &self.queue_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::mergeq_dir()?.join("queue.json")),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            ai_resolve: self.ai_resolve,
            reimagine: self.reimagine,
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mlog_debug!(
            "Config loaded: canonical={} ai_resolve={} reimagine={} command={}",
            config.effective_canonical_branch(),
            config.ai_resolve,
            config.reimagine,
            config.effective_assistant_command()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::mergeq_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
