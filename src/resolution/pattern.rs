//! Outcome sentences stored in the knowledge store.
//!
//! One resolve outcome is written as a single fixed sentence:
//!
//! ```text
//! Merge conflict resolved at tier ai-resolve. Branch: agent/a. Agent: alice. Conflicting files: src/a.rs, src/b.rs.
//! Merge conflict failed at tier auto-resolve. Branch: agent/b. Agent: bob. Conflicting files: src/a.rs.
//! ```
//!
//! The decoder finds every such sentence in a blob, whatever surrounds it.

use regex::Regex;
use std::sync::LazyLock;

use super::Tier;

static PATTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Merge conflict (resolved|failed) at tier ([a-z-]+)\. Branch: (.+?)\. Agent: (.+?)\. Conflicting files: (.*?)\.(?:\s|$)",
    )
    .unwrap()
});

/// One historical outcome parsed back out of free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPattern {
    pub tier: Tier,
    pub success: bool,
    pub files: Vec<String>,
    pub agent: String,
    pub branch: String,
}

impl ConflictPattern {
    pub fn encode(&self) -> String {
        encode_pattern(self.tier, self.success, &self.files, &self.agent, &self.branch)
    }
}

pub fn encode_pattern<S: AsRef<str>>(
    tier: Tier,
    success: bool,
    files: &[S],
    agent: &str,
    branch: &str,
) -> String {
    let verb = if success { "resolved" } else { "failed" };
    let files = files
        .iter()
        .map(|f| f.as_ref())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Merge conflict {} at tier {}. Branch: {}. Agent: {}. Conflicting files: {}.",
        verb, tier, branch, agent, files
    )
}

/// Extract every outcome sentence from `text`. Sentences naming an unknown
/// tier are skipped.
pub fn decode_patterns(text: &str) -> Vec<ConflictPattern> {
    PATTERN_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let tier = caps[2].parse::<Tier>().ok()?;
            let files = caps[5]
                .split(", ")
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
            Some(ConflictPattern {
                tier,
                success: &caps[1] == "resolved",
                files,
                agent: caps[4].to_string(),
                branch: caps[3].to_string(),
            })
        })
        .collect()
}
