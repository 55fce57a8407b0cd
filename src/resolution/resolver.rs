//! Tiered conflict resolution for queued agent branches.
//!
//! `ConflictResolver::resolve` merges one entry's branch into the canonical
//! branch. When the merge conflicts it escalates through `ESCALATION`, one
//! tier at a time, until a tier resolves the conflict or all are exhausted.
//! Past outcomes (read from the knowledge store) can make it skip a tier
//! that keeps failing on the same files, and every conflicted outcome is
//! recorded back for the next call.
//!
//! Calls against the same repository must not overlap; see `drain::RepoLocks`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::git::{ConflictFile, GitOps, MergeAttempt};
use crate::knowledge::{KnowledgeRecord, KnowledgeStore};
use crate::queue::MergeEntry;
use crate::util::{blocking, detach};
use crate::{mlog, mlog_debug, mlog_warn, Error, Result};

use super::{
    build_conflict_history, decode_patterns, encode_pattern, looks_like_prose, CodeAssistant,
    ConflictHistory, Tier,
};

/// Knowledge-store domain for conflict outcomes.
pub const RECORD_DOMAIN: &str = "architecture";
pub const RECORD_TAG: &str = "merge-conflict";

/// Tiers tried after the clean merge conflicts, in order.
pub const ESCALATION: [Tier; 3] = [Tier::AutoResolve, Tier::AiResolve, Tier::Reimagine];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub ai_resolve: bool,
    pub reimagine: bool,
}

/// What one tier handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    Resolved,
    /// Not attempted: disabled, no assistant, or history says it keeps failing.
    Skipped,
    /// Attempted and failed.
    FellThrough,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub entry: MergeEntry,
    pub success: bool,
    /// Tier that landed the branch; `None` on failure.
    pub tier: Option<Tier>,
    /// Paths that conflicted; empty for a clean merge.
    pub conflict_files: Vec<String>,
    /// Failure description naming the last tier attempted.
    pub error_message: Option<String>,
}

impl MergeResult {
    fn merged(mut entry: MergeEntry, tier: Tier, conflict_files: Vec<String>) -> Self {
        entry.mark_merged(tier);
        Self {
            entry,
            success: true,
            tier: Some(tier),
            conflict_files,
            error_message: None,
        }
    }

    fn failed(mut entry: MergeEntry, conflict_files: Vec<String>, message: String) -> Self {
        entry.mark_failed();
        Self {
            entry,
            success: false,
            tier: None,
            conflict_files,
            error_message: Some(message),
        }
    }
}

/// Everything a tier handler needs about the conflict being resolved.
struct TierContext {
    git: GitOps,
    repo_path: PathBuf,
    branch: String,
    canonical: String,
    conflicts: Vec<ConflictFile>,
    /// Files that scope this resolution: the entry's files, or the
    /// conflicting paths when the entry lists none.
    scope: Vec<String>,
    history: ConflictHistory,
}

pub struct ConflictResolver {
    config: ResolverConfig,
    assistant: Option<Arc<dyn CodeAssistant>>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    recordings: Mutex<Vec<JoinHandle<()>>>,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            assistant: None,
            knowledge: None,
            recordings: Mutex::new(Vec::new()),
        }
    }

    pub fn with_assistant(mut self, assistant: Arc<dyn CodeAssistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// Without a knowledge store there is no history and nothing is recorded.
    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn config(&self) -> ResolverConfig {
        self.config
    }

    /// Land `entry.branch_name` on `canonical_branch` in the repository at
    /// `repo_path`.
    ///
    /// Returns `Error::Precondition` when the repository has uncommitted
    /// tracked changes or an unfinished operation, or when the canonical
    /// branch cannot be checked out; in that case nothing was attempted or
    /// recorded. Every
    /// other failure is reported through `MergeResult`, with the repository
    /// reset to its pre-call state.
    pub async fn resolve(
        &self,
        entry: MergeEntry,
        canonical_branch: &str,
        repo_path: &Path,
    ) -> Result<MergeResult> {
        mlog!(
            "resolve: branch={} agent={} canonical={}",
            entry.branch_name,
            entry.agent_name,
            canonical_branch
        );
        let git = Self::checkout_canonical(canonical_branch, repo_path).await?;

        let branch = entry.branch_name.clone();
        let attempt = {
            let git = git.clone();
            blocking(move || git.merge_branch(&branch)).await
        };

        let conflicts = match attempt {
            Ok(MergeAttempt::Clean { commit }) => {
                mlog!("resolve: {} merged cleanly at {}", entry.branch_name, commit);
                return Ok(MergeResult::merged(entry, Tier::CleanMerge, Vec::new()));
            }
            Ok(MergeAttempt::Conflicted(conflicts)) => conflicts,
            Err(e) => {
                mlog_warn!("resolve: clean-merge of {} errored: {}", entry.branch_name, e);
                Self::abort_if_merging(&git).await;
                let message = format!("{} failed: {}", Tier::CleanMerge, e);
                return Ok(MergeResult::failed(entry, Vec::new(), message));
            }
        };

        let conflict_files: Vec<String> = conflicts
            .iter()
            .map(|c| c.path.to_string_lossy().to_string())
            .collect();
        mlog!(
            "resolve: {} conflicts on {}",
            entry.branch_name,
            conflict_files.join(", ")
        );

        let scope = if entry.files_modified.is_empty() {
            conflict_files.clone()
        } else {
            entry.files_modified.clone()
        };
        let history = self.lookup_history(&scope).await;

        let ctx = TierContext {
            git,
            repo_path: repo_path.to_path_buf(),
            branch: entry.branch_name.clone(),
            canonical: canonical_branch.to_string(),
            conflicts,
            scope,
            history,
        };

        let mut last_attempted = Tier::CleanMerge;
        let mut resolved_by = None;
        for tier in ESCALATION {
            match self.run_tier(tier, &ctx).await {
                TierOutcome::Resolved => {
                    resolved_by = Some(tier);
                    break;
                }
                TierOutcome::FellThrough => last_attempted = tier,
                TierOutcome::Skipped => {}
            }
        }

        let result = match resolved_by {
            Some(tier) => {
                mlog!("resolve: {} resolved at tier {}", entry.branch_name, tier);
                MergeResult::merged(entry, tier, conflict_files)
            }
            None => {
                Self::abort(&ctx.git).await;
                let message = format!(
                    "All resolution tiers failed; last attempted tier: {}",
                    last_attempted
                );
                mlog!("resolve: {}: {}", entry.branch_name, message);
                MergeResult::failed(entry, conflict_files, message)
            }
        };

        let recorded_tier = resolved_by.unwrap_or(last_attempted);
        self.record_outcome(&result, recorded_tier);
        Ok(result)
    }

    /// Wait for in-flight history records. Callers that exit without
    /// calling this simply drop them.
    pub async fn flush_records(&self) {
        let handles: Vec<JoinHandle<()>> = match self.recordings.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Open the repository, refuse to touch it when it holds local work or
    /// an unfinished operation, and switch to the canonical branch.
    async fn checkout_canonical(canonical: &str, repo_path: &Path) -> Result<GitOps> {
        let branch = canonical.to_string();
        let path = repo_path.to_path_buf();
        blocking(move || {
            let git = GitOps::new(&path)?;
            if let Some(reason) = git.unready_reason()? {
                return Err(Error::Precondition { branch, reason });
            }
            if git.current_branch()?.as_deref() == Some(branch.as_str()) {
                mlog_debug!("checkout_canonical: already on {}", branch);
            } else {
                git.checkout_branch(&branch)?;
            }
            Ok(git)
        })
        .await
        .map_err(|e| match e {
            Error::Precondition { .. } => e,
            other => Error::Precondition {
                branch: canonical.to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// Reset to HEAD. Only used once the call has left the tree in a state
    /// it owns; the precondition guarantees there was no local work.
    async fn abort(git: &GitOps) {
        let git = git.clone();
        if let Err(e) = blocking(move || git.abort_merge()).await {
            mlog_warn!("abort_merge failed: {}", e);
        }
    }

    async fn abort_if_merging(git: &GitOps) {
        let git = git.clone();
        let result = blocking(move || {
            if git.merge_in_progress()? {
                git.abort_merge()?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            mlog_warn!("abort_merge failed: {}", e);
        }
    }

    async fn lookup_history(&self, scope: &[String]) -> ConflictHistory {
        let Some(store) = &self.knowledge else {
            return ConflictHistory::default();
        };
        let query = format!("merge conflict {}", scope.join(" "));
        match store.search(&query).await {
            Ok(text) => {
                let history = build_conflict_history(&decode_patterns(&text), scope);
                mlog_debug!(
                    "history: skip={:?} past={} predicted={:?}",
                    history.skip_tiers,
                    history.past_resolutions.len(),
                    history.predicted_conflict_files
                );
                history
            }
            Err(e) => {
                mlog_warn!("history lookup failed, continuing without it: {}", e);
                ConflictHistory::default()
            }
        }
    }

    fn tier_enabled(&self, tier: Tier) -> bool {
        if tier.needs_assistant() && self.assistant.is_none() {
            return false;
        }
        match tier {
            Tier::CleanMerge | Tier::AutoResolve => true,
            Tier::AiResolve => self.config.ai_resolve,
            Tier::Reimagine => self.config.reimagine,
        }
    }

    async fn run_tier(&self, tier: Tier, ctx: &TierContext) -> TierOutcome {
        if !self.tier_enabled(tier) {
            mlog_debug!("tier {}: disabled", tier);
            return TierOutcome::Skipped;
        }
        if ctx.history.should_skip(tier) {
            mlog!("tier {}: skipped, repeated failures on these files", tier);
            return TierOutcome::Skipped;
        }

        let attempt = match tier {
            Tier::AutoResolve => self.auto_resolve(ctx).await,
            Tier::AiResolve => self.ai_resolve(ctx).await,
            Tier::Reimagine => self.reimagine(ctx).await,
            Tier::CleanMerge => Ok(false),
        };

        match attempt {
            Ok(true) => TierOutcome::Resolved,
            Ok(false) => {
                mlog!("tier {}: failed", tier);
                TierOutcome::FellThrough
            }
            Err(e) => {
                mlog_warn!("tier {}: errored: {}", tier, e);
                TierOutcome::FellThrough
            }
        }
    }

    /// Take the incoming side of every conflict.
    async fn auto_resolve(&self, ctx: &TierContext) -> Result<bool> {
        let git = ctx.git.clone();
        let conflicts = ctx.conflicts.clone();
        let branch = ctx.branch.clone();
        blocking(move || {
            if !git.take_theirs(&conflicts)? {
                return Ok(false);
            }
            git.finalize_merge(&branch)?;
            Ok(true)
        })
        .await
    }

    async fn ai_resolve(&self, ctx: &TierContext) -> Result<bool> {
        let Some(assistant) = self.assistant.as_deref() else {
            return Ok(false);
        };

        let git = ctx.git.clone();
        let conflicts = blocking(move || git.conflicts()).await?;

        let mut resolutions = Vec::with_capacity(conflicts.len());
        for conflict in &conflicts {
            let prompt = ai_resolve_prompt(conflict, ctx);
            let output = assistant.generate(&prompt, &ctx.repo_path).await?;
            if looks_like_prose(&output) {
                mlog!(
                    "ai-resolve: output for {} rejected as prose",
                    conflict.path.display()
                );
                return Ok(false);
            }
            resolutions.push((conflict.path.clone(), output));
        }

        let git = ctx.git.clone();
        let branch = ctx.branch.clone();
        blocking(move || {
            for (path, content) in &resolutions {
                git.stage_content(path, content)?;
            }
            git.finalize_merge(&branch)?;
            Ok(true)
        })
        .await
    }

    /// Drop the merge and rewrite each scoped file from both branches'
    /// versions, committing straight onto the canonical branch.
    async fn reimagine(&self, ctx: &TierContext) -> Result<bool> {
        let Some(assistant) = self.assistant.as_deref() else {
            return Ok(false);
        };

        let git = ctx.git.clone();
        let scope = ctx.scope.clone();
        let their_ref = format!("refs/heads/{}", ctx.branch);
        let versions = blocking(move || {
            git.abort_merge()?;
            let mut versions = Vec::with_capacity(scope.len());
            for file in scope {
                let path = PathBuf::from(&file);
                let ours = git.read_at("HEAD", &path)?;
                let theirs = git.read_at(&their_ref, &path)?;
                versions.push((path, ours, theirs));
            }
            Ok(versions)
        })
        .await?;

        let mut rewrites = Vec::with_capacity(versions.len());
        for (path, ours, theirs) in versions {
            if ours.is_none() && theirs.is_none() {
                mlog_debug!("reimagine: {} absent on both branches", path.display());
                continue;
            }
            let prompt = reimagine_prompt(&path, ours.as_deref(), theirs.as_deref(), ctx);
            let output = assistant.generate(&prompt, &ctx.repo_path).await?;
            if looks_like_prose(&output) {
                mlog!("reimagine: output for {} rejected as prose", path.display());
                return Ok(false);
            }
            rewrites.push((path, output));
        }

        if rewrites.is_empty() {
            return Ok(false);
        }

        let git = ctx.git.clone();
        let message = format!("Reimagine {} onto {}", ctx.branch, ctx.canonical);
        blocking(move || {
            git.commit_files(&rewrites, &message)?;
            Ok(true)
        })
        .await
    }

    /// Fire off the outcome sentence. Nothing is recorded when no
    /// escalation tier was attempted.
    fn record_outcome(&self, result: &MergeResult, tier: Tier) {
        let Some(store) = self.knowledge.clone() else {
            return;
        };
        if tier == Tier::CleanMerge {
            mlog_debug!("record: no escalation tier attempted, nothing to record");
            return;
        }

        let entry = &result.entry;
        let description = encode_pattern(
            tier,
            result.success,
            &result.conflict_files,
            &entry.agent_name,
            &entry.branch_name,
        );
        let outcome = if result.success { "success" } else { "failure" };
        let record = KnowledgeRecord {
            kind: "pattern".to_string(),
            description,
            tags: vec![
                RECORD_TAG.to_string(),
                tier.to_string(),
                outcome.to_string(),
            ],
            evidence_bead: entry.bead_id.clone(),
        };

        let handle = detach("conflict pattern record", async move {
            store.record(RECORD_DOMAIN, record).await
        });
        if let Ok(mut guard) = self.recordings.lock() {
            guard.retain(|h| !h.is_finished());
            guard.push(handle);
        }
    }
}

fn side_block(label: &str, content: Option<&str>) -> String {
    match content {
        Some(text) => format!("### {}\n```\n{}\n```\n", label, text),
        None => format!("### {}\n(file deleted on this branch)\n", label),
    }
}

fn ai_resolve_prompt(conflict: &ConflictFile, ctx: &TierContext) -> String {
    let mut prompt = format!(
        "You are resolving a git merge conflict between two branches.\n\n## File: {}\n\n",
        conflict.path.display()
    );
    prompt.push_str(&side_block(
        &format!("Canonical branch version ({})", ctx.canonical),
        conflict.ours.as_deref(),
    ));
    prompt.push('\n');
    prompt.push_str(&side_block(
        &format!("Incoming branch version ({})", ctx.branch),
        conflict.theirs.as_deref(),
    ));
    if let Some(base) = conflict.base.as_deref() {
        prompt.push('\n');
        prompt.push_str(&side_block("Common ancestor", Some(base)));
    }
    if let Some(history) = ctx.history.context_block() {
        prompt.push('\n');
        prompt.push_str(&history);
    }
    prompt.push_str(
        "\n## Output\nOutput ONLY the final resolved file content. No explanations, \
         no markdown code fences, no conflict markers.\n",
    );
    prompt
}

fn reimagine_prompt(
    path: &Path,
    ours: Option<&str>,
    theirs: Option<&str>,
    ctx: &TierContext,
) -> String {
    let mut prompt = format!(
        "Two branches changed the same file and their changes could not be merged. \
         Write the file from scratch so that it carries the intent of both versions.\n\n\
         ## File: {}\n\n",
        path.display()
    );
    prompt.push_str(&side_block(
        &format!("Canonical branch version ({})", ctx.canonical),
        ours,
    ));
    prompt.push('\n');
    prompt.push_str(&side_block(
        &format!("Incoming branch version ({})", ctx.branch),
        theirs,
    ));
    if let Some(history) = ctx.history.context_block() {
        prompt.push('\n');
        prompt.push_str(&history);
    }
    prompt.push_str(
        "\n## Output\nOutput ONLY the complete new file content. No explanations, \
         no markdown code fences.\n",
    );
    prompt
}
