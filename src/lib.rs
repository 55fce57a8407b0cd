pub mod config;
pub mod drain;
pub mod error;
pub mod git;
pub mod knowledge;
pub mod log;
pub mod queue;
pub mod resolution;
pub mod util;

pub use error::{Error, Result};
pub use queue::{EntryId, MergeEntry, MergeQueue, MergeStatus};
pub use resolution::{ConflictResolver, MergeResult, ResolverConfig, Tier};
