//! git2-backed command runner used by the resolver.
//!
//! Every method opens the repository fresh so a `GitOps` can be cloned into
//! `spawn_blocking` closures.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, ErrorCode, Oid, Repository, RepositoryState, ResetType, Signature,
    StatusOptions,
};

use crate::{mlog_debug, mlog_warn, Result};

/// Outcome of merging a branch into the checked-out canonical branch.
#[derive(Debug, Clone)]
pub enum MergeAttempt {
    /// Up to date, fast-forwarded, or merged with a merge commit.
    Clean { commit: String },
    /// The merge stopped with conflicts. The merge state is left in place.
    Conflicted(Vec<ConflictFile>),
}

/// One conflicting path, with the content of each side that has one.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictFile {
    pub path: PathBuf,
    /// Canonical branch side. `None` when the canonical branch deleted the file.
    pub ours: Option<String>,
    /// Incoming feature branch side. `None` when the feature branch deleted it.
    pub theirs: Option<String>,
    pub base: Option<String>,
}

impl ConflictFile {
    /// A conflict only carries textual markers when both sides still have
    /// the file. Delete/modify conflicts do not.
    pub fn has_markers(&self) -> bool {
        self.ours.is_some() && self.theirs.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        mlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("mergeq", "mergeq@localhost"))?)
    }

    fn workdir(repo: &Repository) -> Result<PathBuf> {
        repo.workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| git2::Error::from_str("repository has no working directory").into())
    }

    /// Name of the checked-out branch, or `None` for a detached or unborn HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(String::from))
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        mlog_debug!("GitOps::checkout_branch branch={}", branch);
        let repo = self.repo()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let commit = reference.peel_to_commit()?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
        let refname = reference
            .name()
            .map(String::from)
            .unwrap_or_else(|| format!("refs/heads/{}", branch));
        repo.set_head(&refname)?;
        Ok(())
    }

    /// Why the repository cannot take a merge right now, or `None` when it
    /// can. Untracked files are fine; tracked changes and unfinished
    /// operations (merge, rebase, cherry-pick, ...) are not.
    pub fn unready_reason(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let state = repo.state();
        if state != RepositoryState::Clean {
            return Ok(Some(format!("an operation is in progress ({:?})", state)));
        }

        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let changed: Vec<String> = repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter_map(|entry| entry.path().map(String::from))
            .collect();
        if !changed.is_empty() {
            return Ok(Some(format!("uncommitted changes in {}", changed.join(", "))));
        }
        Ok(None)
    }

    /// Merge `branch` into HEAD.
    ///
    /// Fast-forwards when possible. Otherwise performs a three-way merge and
    /// either commits it or leaves the conflicted merge state for a later
    /// tier to resolve or abort.
    pub fn merge_branch(&self, branch: &str) -> Result<MergeAttempt> {
        mlog_debug!("GitOps::merge_branch branch={}", branch);
        let repo = self.repo()?;
        let their_commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let their_annotated = repo.find_annotated_commit(their_commit.id())?;
        let head_commit = repo.head()?.peel_to_commit()?;

        let (analysis, _preference) = repo.merge_analysis(&[&their_annotated])?;

        if analysis.is_up_to_date() {
            mlog_debug!("merge_branch: {} already up to date", branch);
            return Ok(MergeAttempt::Clean {
                commit: head_commit.id().to_string(),
            });
        }

        if analysis.is_fast_forward() {
            mlog_debug!("merge_branch: fast-forward to {}", their_commit.id());
            // Safe checkout refuses to overwrite local edits; the ref only
            // moves once the tree is in place.
            repo.checkout_tree(their_commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
            let mut head_ref = repo.head()?;
            head_ref.set_target(
                their_commit.id(),
                &format!("mergeq: fast-forward to {}", branch),
            )?;
            return Ok(MergeAttempt::Clean {
                commit: their_commit.id().to_string(),
            });
        }

        repo.merge(&[&their_annotated], None, None)?;

        if repo.index()?.has_conflicts() {
            let conflicts = Self::collect_conflicts(&repo)?;
            mlog_debug!("merge_branch: {} conflicting paths", conflicts.len());
            return Ok(MergeAttempt::Conflicted(conflicts));
        }

        let commit = Self::commit_merge(&repo, branch, &head_commit, &their_commit)?;
        Ok(MergeAttempt::Clean { commit })
    }

    fn collect_conflicts(repo: &Repository) -> Result<Vec<ConflictFile>> {
        let index = repo.index()?;
        let mut conflicts = Vec::new();

        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).to_string())
                .unwrap_or_default();

            conflicts.push(ConflictFile {
                path: PathBuf::from(path),
                ours: Self::blob_text(repo, conflict.our.as_ref().map(|e| e.id))?,
                theirs: Self::blob_text(repo, conflict.their.as_ref().map(|e| e.id))?,
                base: Self::blob_text(repo, conflict.ancestor.as_ref().map(|e| e.id))?,
            });
        }

        Ok(conflicts)
    }

    fn blob_text(repo: &Repository, oid: Option<Oid>) -> Result<Option<String>> {
        match oid {
            Some(id) if !id.is_zero() => {
                let blob = repo.find_blob(id)?;
                Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
            }
            _ => Ok(None),
        }
    }

    /// Conflicting paths of the in-progress merge.
    pub fn conflicts(&self) -> Result<Vec<ConflictFile>> {
        let repo = self.repo()?;
        Self::collect_conflicts(&repo)
    }

    /// Resolve every conflict by taking the feature branch's blob, byte for
    /// byte.
    ///
    /// All-or-nothing: returns `false` without touching the index when any
    /// conflict lacks one side.
    pub fn take_theirs(&self, conflicts: &[ConflictFile]) -> Result<bool> {
        if let Some(unmarked) = conflicts.iter().find(|c| !c.has_markers()) {
            mlog_debug!(
                "take_theirs: {} has no textual conflict, giving up",
                unmarked.path.display()
            );
            return Ok(false);
        }

        let repo = self.repo()?;
        let mut index = repo.index()?;
        let mut incoming = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let Some(their) = conflict.their else {
                return Ok(false);
            };
            let path = PathBuf::from(String::from_utf8_lossy(&their.path).to_string());
            incoming.push((path, their.id, their.mode));
        }

        let workdir = Self::workdir(&repo)?;
        for (path, blob_id, mode) in incoming {
            let blob = repo.find_blob(blob_id)?;
            let full = workdir.join(&path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, blob.content())?;
            set_executable(&full, mode)?;

            index.conflict_remove(&path)?;
            index.add_path(&path)?;
        }
        index.write()?;
        Ok(true)
    }

    /// Write `content` to `path` in the working tree and stage it, clearing
    /// any conflict entries for the path.
    pub fn stage_content(&self, path: &Path, content: &str) -> Result<()> {
        let repo = self.repo()?;
        Self::stage(&repo, path, content)
    }

    fn stage(repo: &Repository, path: &Path, content: &str) -> Result<()> {
        let full = Self::workdir(repo)?.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, content)?;

        let mut index = repo.index()?;
        // Ignore NotFound: the path may not be conflicted
        let _ = index.conflict_remove(path);
        index.add_path(path)?;
        index.write()?;
        Ok(())
    }

    /// Commit the in-progress merge of `branch` once no conflicts remain.
    pub fn finalize_merge(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        if repo.index()?.has_conflicts() {
            return Err(git2::Error::from_str("unresolved conflicts remain in the index").into());
        }
        let head_commit = repo.head()?.peel_to_commit()?;
        let their_commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Self::commit_merge(&repo, branch, &head_commit, &their_commit)
    }

    fn commit_merge(
        repo: &Repository,
        branch: &str,
        head_commit: &Commit<'_>,
        their_commit: &Commit<'_>,
    ) -> Result<String> {
        let sig = Self::signature(repo)?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let canonical = repo
            .head()?
            .shorthand()
            .map(String::from)
            .unwrap_or_else(|| "HEAD".to_string());
        let message = format!("Merge branch '{}' into {}", branch, canonical);

        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[head_commit, their_commit],
        )?;
        repo.cleanup_state()?;
        mlog_debug!("Merge commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }

    pub fn merge_in_progress(&self) -> Result<bool> {
        let repo = self.repo()?;
        Ok(repo.state() == RepositoryState::Merge)
    }

    /// Abort any in-progress merge and reset the working tree and index to HEAD.
    ///
    /// Files that exist only because of the merge (paths absent from HEAD)
    /// are removed as well.
    pub fn abort_merge(&self) -> Result<()> {
        mlog_debug!("GitOps::abort_merge path={}", self.repo_path.display());
        let repo = self.repo()?;
        let workdir = Self::workdir(&repo)?;

        let mut merge_paths: HashSet<PathBuf> = HashSet::new();
        {
            let index = repo.index()?;
            if index.has_conflicts() {
                for conflict in index.conflicts()? {
                    let conflict = conflict?;
                    for entry in [&conflict.our, &conflict.their, &conflict.ancestor]
                        .into_iter()
                        .flatten()
                    {
                        merge_paths.insert(PathBuf::from(
                            String::from_utf8_lossy(&entry.path).to_string(),
                        ));
                    }
                }
            }
            for entry in index.iter() {
                merge_paths.insert(PathBuf::from(
                    String::from_utf8_lossy(&entry.path).to_string(),
                ));
            }
        }

        repo.cleanup_state()?;
        let head = repo.head()?.peel_to_commit()?;
        repo.reset(
            head.as_object(),
            ResetType::Hard,
            Some(CheckoutBuilder::new().force()),
        )?;

        let tree = head.tree()?;
        for path in merge_paths {
            if tree.get_path(&path).is_ok() {
                continue;
            }
            let full = workdir.join(&path);
            if full.is_file() {
                if let Err(e) = fs::remove_file(&full) {
                    mlog_warn!("abort_merge: could not remove {}: {}", full.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Content of `path` in the tree of `rev`, `None` when absent there.
    pub fn read_at(&self, rev: &str, path: &Path) -> Result<Option<String>> {
        let repo = self.repo()?;
        let tree = repo.revparse_single(rev)?.peel_to_commit()?.tree()?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = entry.to_object(&repo)?.peel_to_blob()?;
        Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
    }

    /// Write the given files and commit them on HEAD with a single parent.
    pub fn commit_files(&self, files: &[(PathBuf, String)], message: &str) -> Result<String> {
        mlog_debug!("GitOps::commit_files count={} message={}", files.len(), message);
        let repo = self.repo()?;
        for (path, content) in files {
            Self::stage(&repo, path, content)?;
        }

        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let parent = repo.head()?.peel_to_commit()?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        mlog_debug!("Commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0o100755 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
