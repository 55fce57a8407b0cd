//! Tiered merge-conflict resolution.

pub mod assistant;
pub mod history;
pub mod pattern;
pub mod prose;
pub mod resolver;
pub mod tier;

pub use assistant::{CodeAssistant, CommandAssistant};
pub use history::{build_conflict_history, ConflictHistory, SKIP_FAILURE_THRESHOLD};
pub use pattern::{decode_patterns, encode_pattern, ConflictPattern};
pub use prose::looks_like_prose;
pub use resolver::{
    ConflictResolver, MergeResult, ResolverConfig, TierOutcome, ESCALATION, RECORD_DOMAIN,
    RECORD_TAG,
};
pub use tier::Tier;
