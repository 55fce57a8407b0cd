use serde::{Deserialize, Serialize};

use crate::Error;

/// Escalating conflict-resolution strategies, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    CleanMerge,
    AutoResolve,
    AiResolve,
    Reimagine,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::CleanMerge,
        Tier::AutoResolve,
        Tier::AiResolve,
        Tier::Reimagine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::CleanMerge => "clean-merge",
            Tier::AutoResolve => "auto-resolve",
            Tier::AiResolve => "ai-resolve",
            Tier::Reimagine => "reimagine",
        }
    }

    /// Whether this tier calls the external code assistant.
    pub fn needs_assistant(&self) -> bool {
        matches!(self, Tier::AiResolve | Tier::Reimagine)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidTier(s.to_string()))
    }
}
