//! Turns past outcomes into hints for the current resolve call.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{ConflictPattern, Tier};

/// Failures needed (with zero successes) before a tier is skipped.
pub const SKIP_FAILURE_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictHistory {
    /// Tiers with a poor record on overlapping files.
    pub skip_tiers: BTreeSet<Tier>,
    /// One line per past success on overlapping files.
    pub past_resolutions: Vec<String>,
    /// Every file touched by an overlapping pattern, in first-seen order.
    pub predicted_conflict_files: Vec<String>,
}

impl ConflictHistory {
    pub fn should_skip(&self, tier: Tier) -> bool {
        self.skip_tiers.contains(&tier)
    }

    pub fn has_context(&self) -> bool {
        !self.past_resolutions.is_empty()
            || !self.skip_tiers.is_empty()
            || !self.predicted_conflict_files.is_empty()
    }

    /// "Historical context" section for assistant prompts, or `None` when
    /// nothing matched.
    pub fn context_block(&self) -> Option<String> {
        if !self.has_context() {
            return None;
        }

        let mut block = String::from("## Historical context\n");
        if !self.past_resolutions.is_empty() {
            block.push_str("Past successful resolutions on these files:\n");
            for line in &self.past_resolutions {
                block.push_str(&format!("- {}\n", line));
            }
        }
        if !self.skip_tiers.is_empty() {
            let tiers: Vec<&str> = self.skip_tiers.iter().map(Tier::as_str).collect();
            block.push_str(&format!(
                "Tiers that repeatedly failed on these files: {}\n",
                tiers.join(", ")
            ));
        }
        if !self.predicted_conflict_files.is_empty() {
            block.push_str(&format!(
                "Files that conflicted together before: {}\n",
                self.predicted_conflict_files.join(", ")
            ));
        }
        Some(block)
    }
}

/// Build hints from `patterns`, keeping only those whose files overlap
/// `current_files`.
pub fn build_conflict_history<S: AsRef<str>>(
    patterns: &[ConflictPattern],
    current_files: &[S],
) -> ConflictHistory {
    let current: HashSet<&str> = current_files.iter().map(|f| f.as_ref()).collect();

    let relevant: Vec<&ConflictPattern> = patterns
        .iter()
        .filter(|p| p.files.iter().any(|f| current.contains(f.as_str())))
        .collect();

    // tier -> (successes, failures)
    let mut tally: BTreeMap<Tier, (usize, usize)> = BTreeMap::new();
    let mut history = ConflictHistory::default();
    let mut seen_files: HashSet<&str> = HashSet::new();

    for pattern in &relevant {
        let counts = tally.entry(pattern.tier).or_default();
        if pattern.success {
            counts.0 += 1;
            history.past_resolutions.push(format!(
                "{} resolved {} (branch {}, agent {})",
                pattern.tier,
                pattern.files.join(", "),
                pattern.branch,
                pattern.agent
            ));
        } else {
            counts.1 += 1;
        }

        for file in &pattern.files {
            if seen_files.insert(file.as_str()) {
                history.predicted_conflict_files.push(file.clone());
            }
        }
    }

    history.skip_tiers = tally
        .into_iter()
        .filter(|(_, (successes, failures))| {
            *successes == 0 && *failures >= SKIP_FAILURE_THRESHOLD
        })
        .map(|(tier, _)| tier)
        .collect();

    history
}
