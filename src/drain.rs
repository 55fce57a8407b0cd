//! Drains the merge queue into a repository, one entry at a time.
//!
//! A working tree has no transactional concurrency, so every resolve call
//! against a repository runs under that repository's lock in `RepoLocks`.
//! Cancellation is checked between entries only; an in-flight resolve is
//! always allowed to finish and restore the tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::queue::MergeQueue;
use crate::resolution::{ConflictResolver, MergeResult};
use crate::{mlog, mlog_debug, mlog_error, Result};

/// One async lock per repository, keyed by canonical path.
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for `repo`. Paths that cannot be canonicalized are keyed as given.
    pub fn lock_for(&self, repo: &Path) -> Arc<Mutex<()>> {
        let key = std::fs::canonicalize(repo).unwrap_or_else(|_| repo.to_path_buf());
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_default().clone()
    }
}

pub struct Drainer {
    resolver: Arc<ConflictResolver>,
    queue: Arc<Mutex<MergeQueue>>,
    locks: Arc<RepoLocks>,
}

impl Drainer {
    pub fn new(resolver: Arc<ConflictResolver>, queue: Arc<Mutex<MergeQueue>>) -> Self {
        Self {
            resolver,
            queue,
            locks: Arc::new(RepoLocks::new()),
        }
    }

    /// Share locks with other drainers working on the same repositories.
    pub fn with_locks(mut self, locks: Arc<RepoLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn queue(&self) -> &Arc<Mutex<MergeQueue>> {
        &self.queue
    }

    /// Resolve the oldest pending entry and persist its outcome.
    ///
    /// Returns `Ok(None)` when nothing is pending. On a precondition error
    /// the stored entry is left pending and the error is returned.
    pub async fn drain_once(&self, repo: &Path, canonical: &str) -> Result<Option<MergeResult>> {
        let lock = self.locks.lock_for(repo);
        let _guard = lock.lock().await;

        let next = self.queue.lock().await.dequeue();
        let Some(entry) = next else {
            mlog_debug!("drain_once: queue empty");
            return Ok(None);
        };
        let id = entry.id;

        let result = match self.resolver.resolve(entry, canonical, repo).await {
            Ok(result) => result,
            Err(e) => {
                mlog_error!("drain_once: entry {} not attempted: {}", id.short(), e);
                return Err(e);
            }
        };

        let mut queue = self.queue.lock().await;
        queue.update(result.entry.clone())?;
        queue.save().await?;
        mlog!(
            "drain_once: entry {} -> {} ({})",
            id.short(),
            result.entry.status(),
            result
                .tier
                .map(|t| t.to_string())
                .or_else(|| result.error_message.clone())
                .unwrap_or_default()
        );
        Ok(Some(result))
    }

    /// Drain until the queue has no pending entries or `cancel` fires.
    pub async fn run(
        &self,
        repo: &Path,
        canonical: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<MergeResult>> {
        let mut results = Vec::new();
        while !cancel.is_cancelled() {
            match self.drain_once(repo, canonical).await? {
                Some(result) => results.push(result),
                None => break,
            }
        }
        if cancel.is_cancelled() {
            mlog!("drain: cancelled after {} entries", results.len());
        }
        Ok(results)
    }
}
