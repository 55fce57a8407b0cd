//! Knowledge store: free-text facts the resolver learns from.
//!
//! The resolver only depends on the `KnowledgeStore` trait. `GitNotesKnowledge`
//! keeps records inside the repository itself as JSON git notes under
//! `refs/notes/mergeq-knowledge`, so history travels with the repo.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{ErrorCode, Oid, Repository, Signature};
use serde::{Deserialize, Serialize};

use crate::util::blocking;
use crate::{mlog_debug, Result};

const NOTES_REF: &str = "refs/notes/mergeq-knowledge";

/// One fact to store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub evidence_bead: String,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Free-text search; the result is whatever text matched, concatenated.
    async fn search(&self, query: &str) -> Result<String>;

    async fn record(&self, domain: &str, record: KnowledgeRecord) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    domain: String,
    #[serde(flatten)]
    record: KnowledgeRecord,
    recorded_at: DateTime<Utc>,
}

impl StoredRecord {
    fn matches(&self, terms: &[String]) -> bool {
        if terms.is_empty() {
            return true;
        }
        let description = self.record.description.to_lowercase();
        terms.iter().any(|term| {
            description.contains(term.as_str())
                || self.record.tags.iter().any(|t| t.eq_ignore_ascii_case(term))
        })
    }
}

/// Knowledge store backed by git notes in the repository at `repo_path`.
#[derive(Debug, Clone)]
pub struct GitNotesKnowledge {
    repo_path: PathBuf,
}

impl GitNotesKnowledge {
    pub fn new(repo_path: &Path) -> Result<Self> {
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    fn read_note(repo: &Repository, oid: Oid) -> Result<Vec<StoredRecord>> {
        let message = match repo.find_note(Some(NOTES_REF), oid) {
            Ok(note) => note.message().unwrap_or("[]").to_string(),
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&message)?)
    }

    /// Append a record to the note on the current HEAD commit.
    fn append_sync(&self, stored: StoredRecord) -> Result<()> {
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?.id();
        let mut records = Self::read_note(&repo, head)?;
        records.push(stored);

        let json = serde_json::to_string_pretty(&records)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("mergeq", "mergeq@localhost"))?;
        repo.note(&sig, &sig, Some(NOTES_REF), head, &json, true)?;
        mlog_debug!("Knowledge record appended to note on {}", head);
        Ok(())
    }

    /// Every stored record, oldest commit order not guaranteed.
    fn all_sync(&self) -> Result<Vec<StoredRecord>> {
        let repo = self.repo()?;
        let notes = match repo.notes(Some(NOTES_REF)) {
            Ok(notes) => notes,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for note in notes {
            let (_, annotated) = note?;
            records.extend(Self::read_note(&repo, annotated)?);
        }
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }
}

#[async_trait]
impl KnowledgeStore for GitNotesKnowledge {
    async fn search(&self, query: &str) -> Result<String> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        let store = self.clone();
        let records = blocking(move || store.all_sync()).await?;

        let lines: Vec<String> = records
            .into_iter()
            .filter(|r| r.matches(&terms))
            .map(|r| r.record.description)
            .collect();
        Ok(lines.join("\n"))
    }

    async fn record(&self, domain: &str, record: KnowledgeRecord) -> Result<()> {
        let stored = StoredRecord {
            domain: domain.to_string(),
            record,
            recorded_at: Utc::now(),
        };
        let store = self.clone();
        blocking(move || store.append_sync(stored)).await
    }
}
