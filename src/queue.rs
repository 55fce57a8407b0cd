//! Persisted merge queue.
//!
//! Entries are produced when an agent asks to integrate its branch and are
//! consumed by the drainer. The whole queue lives in one JSON file that is
//! rewritten atomically on every save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::resolution::Tier;
use crate::util::blocking;
use crate::{mlog_debug, Error, Result};

const QUEUE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    #[default]
    Pending,
    Merged,
    Failed,
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStatus::Pending => write!(f, "pending"),
            MergeStatus::Merged => write!(f, "merged"),
            MergeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A branch waiting to land on the canonical branch.
///
/// `resolved_tier` is set exactly when `status` is `Merged`; the fields are
/// private so only the transition methods can change them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEntry {
    pub id: EntryId,
    pub branch_name: String,
    /// Task that produced the branch.
    pub bead_id: String,
    pub agent_name: String,
    /// Paths the agent touched, in the order it reported them.
    pub files_modified: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    status: MergeStatus,
    resolved_tier: Option<Tier>,
}

impl MergeEntry {
    pub fn new(
        branch_name: impl Into<String>,
        bead_id: impl Into<String>,
        agent_name: impl Into<String>,
        files_modified: Vec<String>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            branch_name: branch_name.into(),
            bead_id: bead_id.into(),
            agent_name: agent_name.into(),
            files_modified,
            enqueued_at: Utc::now(),
            status: MergeStatus::Pending,
            resolved_tier: None,
        }
    }

    pub fn status(&self) -> MergeStatus {
        self.status
    }

    pub fn resolved_tier(&self) -> Option<Tier> {
        self.resolved_tier
    }

    pub fn is_pending(&self) -> bool {
        self.status == MergeStatus::Pending
    }

    pub fn mark_merged(&mut self, tier: Tier) {
        self.status = MergeStatus::Merged;
        self.resolved_tier = Some(tier);
    }

    pub fn mark_failed(&mut self) {
        self.status = MergeStatus::Failed;
        self.resolved_tier = None;
    }

    /// Send a failed entry back to the queue.
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != MergeStatus::Failed {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: MergeStatus::Pending.to_string(),
            });
        }
        self.status = MergeStatus::Pending;
        self.resolved_tier = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    entries: Vec<MergeEntry>,
}

/// JSON-file-backed list of merge entries, in enqueue order.
#[derive(Debug)]
pub struct MergeQueue {
    path: PathBuf,
    entries: Vec<MergeEntry>,
}

impl MergeQueue {
    /// Load the queue at `path`, or start empty if the file does not exist.
    pub fn open_sync(path: &Path) -> Result<Self> {
        mlog_debug!("MergeQueue::open path={}", path.display());
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                entries: Vec::new(),
            });
        }
        let file: QueueFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        mlog_debug!("MergeQueue loaded: {} entries", file.entries.len());
        Ok(Self {
            path: path.to_path_buf(),
            entries: file.entries,
        })
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || Self::open_sync(&path)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the queue: temp file, backup of the previous file, rename.
    pub fn save_sync(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(&QueueFile {
            version: QUEUE_VERSION,
            entries: self.entries.clone(),
        })?;

        if self.path.exists() {
            fs::copy(&self.path, self.path.with_extension("json.bak"))?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &self.path)?;
        mlog_debug!("MergeQueue saved: {} entries", self.entries.len());
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let snapshot = Self {
            path: self.path.clone(),
            entries: self.entries.clone(),
        };
        blocking(move || snapshot.save_sync()).await
    }

    pub fn enqueue(&mut self, entry: MergeEntry) -> EntryId {
        let id = entry.id;
        mlog_debug!(
            "MergeQueue::enqueue id={} branch={} agent={}",
            id.short(),
            entry.branch_name,
            entry.agent_name
        );
        self.entries.push(entry);
        id
    }

    /// Oldest pending entry, cloned out for the resolver. The stored copy
    /// stays pending until `update` writes the outcome back.
    pub fn dequeue(&self) -> Option<MergeEntry> {
        self.entries.iter().find(|e| e.is_pending()).cloned()
    }

    /// Replace the stored entry with the same id.
    pub fn update(&mut self, entry: MergeEntry) -> Result<()> {
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| Error::EntryNotFound(entry.id.to_string()))?;
        *slot = entry;
        Ok(())
    }

    pub fn requeue(&mut self, id: EntryId) -> Result<()> {
        self.get_mut(id)?.requeue()
    }

    pub fn get(&self, id: EntryId) -> Option<&MergeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: EntryId) -> Result<&mut MergeEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::EntryNotFound(id.to_string()))
    }

    /// Find by full id or by the 8-character short form.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<&MergeEntry> {
        self.entries
            .iter()
            .find(|e| e.id.to_string().starts_with(prefix))
    }

    pub fn list(&self) -> &[MergeEntry] {
        &self.entries
    }

    pub fn pending(&self) -> Vec<&MergeEntry> {
        self.entries.iter().filter(|e| e.is_pending()).collect()
    }

    pub fn purge(&mut self, id: EntryId) -> Option<MergeEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Drop every merged or failed entry; returns how many were removed.
    pub fn purge_finished(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(MergeEntry::is_pending);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
