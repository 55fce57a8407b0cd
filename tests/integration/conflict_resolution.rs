//! Conflict resolution integration tests.
//!
//! These drive `ConflictResolver::resolve` against real repositories built
//! with the git CLI, with a scripted assistant and in-memory history.

use std::sync::Arc;

use mergeq::knowledge::KnowledgeStore;
use mergeq::resolution::{decode_patterns, CodeAssistant, ConflictResolver, ResolverConfig, Tier};
use mergeq::{Error, MergeEntry, MergeStatus};

use crate::fixtures::{
    feature_entry, MemoryKnowledge, ScriptedAssistant, TestRepo, FEATURE_BRANCH, SHARED_FILE,
};

const VALID_CODE: &str = "fn resolved() -> u32 {\n    42\n}";
const PROSE: &str = "Here's the resolved content:\n```\nx\n```";

fn resolver(
    config: ResolverConfig,
    assistant: Option<Arc<ScriptedAssistant>>,
    knowledge: Option<Arc<MemoryKnowledge>>,
) -> ConflictResolver {
    let mut resolver = ConflictResolver::new(config);
    if let Some(assistant) = assistant {
        let assistant: Arc<dyn CodeAssistant> = assistant;
        resolver = resolver.with_assistant(assistant);
    }
    if let Some(knowledge) = knowledge {
        let knowledge: Arc<dyn KnowledgeStore> = knowledge;
        resolver = resolver.with_knowledge(knowledge);
    }
    resolver
}

fn ai_only() -> ResolverConfig {
    ResolverConfig {
        ai_resolve: true,
        reimagine: false,
    }
}

/// Scenario A: distinct new files on each side merge cleanly.
#[tokio::test]
async fn test_distinct_files_merge_cleanly() {
    let repo = TestRepo::with_distinct_files();
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(ResolverConfig::default(), None, Some(knowledge.clone()));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert!(result.success);
    assert_eq!(result.tier, Some(Tier::CleanMerge));
    assert!(result.conflict_files.is_empty());
    assert!(result.error_message.is_none());
    assert_eq!(result.entry.status(), MergeStatus::Merged);
    assert_eq!(result.entry.resolved_tier(), Some(Tier::CleanMerge));

    assert_eq!(repo.read("feature.txt").as_deref(), Some("feature content\n"));
    assert_eq!(repo.read("main.txt").as_deref(), Some("main content\n"));
    assert_eq!(repo.head_parents(), 2);
    assert_eq!(repo.status(), "");

    // no conflict, nothing learned
    assert!(knowledge.records().is_empty());
}

#[tokio::test]
async fn test_fast_forward_counts_as_clean_merge() {
    let repo = TestRepo::new();
    repo.checkout_new("feature");
    let tip = repo.commit_file("new.txt", "new\n", "Add new");
    repo.checkout("main");

    let resolver = resolver(ResolverConfig::default(), None, None);
    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert_eq!(result.tier, Some(Tier::CleanMerge));
    assert_eq!(repo.head(), tip);
    assert_eq!(repo.status(), "");
}

/// Scenario B: same line edited on both sides; the incoming side wins.
#[tokio::test]
async fn test_line_conflict_auto_resolves_to_incoming() {
    let repo = TestRepo::with_line_conflict();
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(ResolverConfig::default(), None, Some(knowledge.clone()));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert!(result.success);
    assert_eq!(result.tier, Some(Tier::AutoResolve));
    assert_eq!(result.conflict_files, vec![SHARED_FILE.to_string()]);
    assert_eq!(result.entry.resolved_tier(), Some(Tier::AutoResolve));
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some("feature line\n"));
    assert_eq!(repo.head_parents(), 2);
    assert_eq!(repo.status(), "");

    let records = knowledge.records();
    assert_eq!(records.len(), 1);
    let (domain, record) = &records[0];
    assert_eq!(domain, "architecture");
    assert_eq!(record.kind, "pattern");
    assert_eq!(record.evidence_bead, "bead-42");
    assert_eq!(record.tags, vec!["merge-conflict", "auto-resolve", "success"]);

    let decoded = decode_patterns(&record.description);
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].tier, Tier::AutoResolve);
    assert!(decoded[0].success);
    assert_eq!(decoded[0].files, vec![SHARED_FILE.to_string()]);
    assert_eq!(decoded[0].agent, "alice");
    assert_eq!(decoded[0].branch, "feature");
}

/// Scenario C: delete/modify with no assistant tiers fails and leaves
/// the repository as it was.
#[tokio::test]
async fn test_delete_modify_without_ai_fails_clean() {
    let repo = TestRepo::with_delete_modify_conflict();
    let before = repo.head();
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(ResolverConfig::default(), None, Some(knowledge.clone()));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert!(!result.success);
    assert_eq!(result.tier, None);
    assert_eq!(result.entry.status(), MergeStatus::Failed);
    assert_eq!(result.entry.resolved_tier(), None);
    assert_eq!(result.conflict_files, vec![SHARED_FILE.to_string()]);
    assert_eq!(
        result.error_message.as_deref(),
        Some("All resolution tiers failed; last attempted tier: auto-resolve")
    );

    assert_eq!(repo.head(), before);
    assert_eq!(repo.status(), "");
    assert!(repo.read(SHARED_FILE).is_none());

    let records = knowledge.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].1.tags,
        vec!["merge-conflict", "auto-resolve", "failure"]
    );
}

/// Scenario D: the assistant's code replaces the conflicted file.
#[tokio::test]
async fn test_delete_modify_resolved_by_ai() {
    let repo = TestRepo::with_delete_modify_conflict();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let resolver = resolver(ai_only(), Some(assistant.clone()), None);

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.tier, Some(Tier::AiResolve));
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some(VALID_CODE));
    assert_eq!(repo.head_parents(), 2);
    assert_eq!(repo.status(), "");

    assert_eq!(assistant.calls(), 1);
    let prompt = &assistant.prompts()[0];
    assert!(prompt.contains("## File: shared.txt"));
    assert!(prompt.contains("(file deleted on this branch)"));
    assert!(prompt.contains("feature line"));
}

/// Scenario E: prose from the assistant is rejected and nothing else is
/// enabled, so the call fails.
#[tokio::test]
async fn test_prose_output_falls_through_to_failure() {
    let repo = TestRepo::with_delete_modify_conflict();
    let before = repo.head();
    let assistant = ScriptedAssistant::always(PROSE);
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(ai_only(), Some(assistant.clone()), Some(knowledge.clone()));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert!(!result.success);
    assert_eq!(result.entry.resolved_tier(), None);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .ends_with("last attempted tier: ai-resolve"));
    assert_eq!(assistant.calls(), 1);
    assert_eq!(repo.head(), before);
    assert_eq!(repo.status(), "");

    let records = knowledge.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.tags, vec!["merge-conflict", "ai-resolve", "failure"]);
}

#[tokio::test]
async fn test_auto_resolvable_conflict_never_reaches_assistant() {
    let repo = TestRepo::with_line_conflict();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let resolver = resolver(
        ResolverConfig {
            ai_resolve: true,
            reimagine: true,
        },
        Some(assistant.clone()),
        None,
    );

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert_eq!(result.tier, Some(Tier::AutoResolve));
    assert_eq!(assistant.calls(), 0);
}

#[tokio::test]
async fn test_ai_enabled_without_assistant_is_skipped() {
    let repo = TestRepo::with_delete_modify_conflict();
    let resolver = resolver(ai_only(), None, None);

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .ends_with("last attempted tier: auto-resolve"));
    assert_eq!(repo.status(), "");
}

#[tokio::test]
async fn test_repeated_ai_failures_skip_assistant() {
    let repo = TestRepo::with_delete_modify_conflict();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let knowledge = MemoryKnowledge::seeded(&[(Tier::AiResolve, false), (Tier::AiResolve, false)]);
    let resolver = resolver(ai_only(), Some(assistant.clone()), Some(knowledge));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(assistant.calls(), 0);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .ends_with("last attempted tier: auto-resolve"));
    assert_eq!(repo.status(), "");
}

#[tokio::test]
async fn test_single_success_keeps_tier_eligible() {
    let repo = TestRepo::with_delete_modify_conflict();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let knowledge = MemoryKnowledge::seeded(&[
        (Tier::AiResolve, false),
        (Tier::AiResolve, false),
        (Tier::AiResolve, true),
    ]);
    let resolver = resolver(ai_only(), Some(assistant.clone()), Some(knowledge));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert_eq!(result.tier, Some(Tier::AiResolve));
    assert_eq!(assistant.calls(), 1);
    let prompt = &assistant.prompts()[0];
    assert!(prompt.contains("## Historical context"));
    assert!(prompt.contains("ai-resolve resolved shared.txt"));
}

#[tokio::test]
async fn test_skipped_auto_resolve_with_nothing_else_records_nothing() {
    let repo = TestRepo::with_line_conflict();
    let before = repo.head();
    let knowledge =
        MemoryKnowledge::seeded(&[(Tier::AutoResolve, false), (Tier::AutoResolve, false)]);
    let resolver = resolver(ResolverConfig::default(), None, Some(knowledge.clone()));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert!(!result.success);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .ends_with("last attempted tier: clean-merge"));
    assert_eq!(repo.head(), before);
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some("main line\n"));
    assert_eq!(repo.status(), "");
    // only the two seeded records
    assert_eq!(knowledge.records().len(), 2);
}

#[tokio::test]
async fn test_reimagine_commits_rewrite_on_canonical() {
    let repo = TestRepo::with_delete_modify_conflict();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let resolver = resolver(
        ResolverConfig {
            ai_resolve: false,
            reimagine: true,
        },
        Some(assistant.clone()),
        None,
    );

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.tier, Some(Tier::Reimagine));
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some(VALID_CODE));
    assert_eq!(repo.head_parents(), 1);
    assert_eq!(repo.current_branch(), "main");
    assert_eq!(repo.status(), "");

    assert_eq!(assistant.calls(), 1);
    assert!(assistant.prompts()[0].contains("Write the file from scratch"));
}

#[tokio::test]
async fn test_reimagine_catches_ai_resolve_prose() {
    let repo = TestRepo::with_delete_modify_conflict();
    let assistant = ScriptedAssistant::sequence(&[PROSE, VALID_CODE]);
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(
        ResolverConfig {
            ai_resolve: true,
            reimagine: true,
        },
        Some(assistant.clone()),
        Some(knowledge.clone()),
    );

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert_eq!(result.tier, Some(Tier::Reimagine));
    assert_eq!(assistant.calls(), 2);
    assert_eq!(repo.status(), "");

    let records = knowledge.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.tags, vec!["merge-conflict", "reimagine", "success"]);
}

#[tokio::test]
async fn test_reimagine_falls_back_to_conflict_files() {
    let repo = TestRepo::with_delete_modify_conflict();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let resolver = resolver(
        ResolverConfig {
            ai_resolve: false,
            reimagine: true,
        },
        Some(assistant.clone()),
        None,
    );

    let mut entry = feature_entry();
    entry.files_modified.clear();
    let result = resolver.resolve(entry, "main", &repo.path).await.unwrap();

    assert_eq!(result.tier, Some(Tier::Reimagine));
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some(VALID_CODE));
}

#[tokio::test]
async fn test_checkout_skip_equivalence() {
    let on_main = TestRepo::with_line_conflict();
    let elsewhere = TestRepo::with_line_conflict();
    elsewhere.checkout("feature");

    let resolver = resolver(ResolverConfig::default(), None, None);
    let a = resolver
        .resolve(feature_entry(), "main", &on_main.path)
        .await
        .unwrap();
    let b = resolver
        .resolve(feature_entry(), "main", &elsewhere.path)
        .await
        .unwrap();

    assert_eq!(a.success, b.success);
    assert_eq!(a.tier, b.tier);
    assert_eq!(a.conflict_files, b.conflict_files);
    assert_eq!(elsewhere.current_branch(), "main");
    assert_eq!(on_main.read(SHARED_FILE), elsewhere.read(SHARED_FILE));
}

#[tokio::test]
async fn test_missing_canonical_branch_is_precondition_error() {
    let repo = TestRepo::with_line_conflict();
    let before = repo.head();
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(ai_only(), Some(assistant.clone()), Some(knowledge.clone()));

    let err = resolver
        .resolve(feature_entry(), "trunk", &repo.path)
        .await
        .unwrap_err();
    resolver.flush_records().await;

    match err {
        Error::Precondition { branch, .. } => assert_eq!(branch, "trunk"),
        other => panic!("expected precondition error, got {other:?}"),
    }
    assert_eq!(assistant.calls(), 0);
    assert!(knowledge.records().is_empty());
    assert_eq!(repo.head(), before);
    assert_eq!(repo.status(), "");
}

#[tokio::test]
async fn test_recording_failure_does_not_change_result() {
    let repo = TestRepo::with_line_conflict();
    let resolver = resolver(ResolverConfig::default(), None, Some(MemoryKnowledge::failing()));

    let result = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap();
    resolver.flush_records().await;

    assert!(result.success);
    assert_eq!(result.tier, Some(Tier::AutoResolve));
    assert_eq!(repo.status(), "");
}

#[tokio::test]
async fn test_binary_conflict_takes_incoming_bytes_exactly() {
    let incoming: &[u8] = &[0xff, 0xfe, 0x00, 0x80, b'A', 0xc3, 0x28];
    let repo = TestRepo::new();
    repo.commit_bytes("blob.bin", &[0x00, 0x01, 0x02], "Add blob");
    repo.checkout_new(FEATURE_BRANCH);
    repo.commit_bytes("blob.bin", incoming, "Feature rewrites blob");
    repo.checkout("main");
    repo.commit_bytes("blob.bin", &[0x00, 0x9f, 0x92, 0x96], "Main rewrites blob");

    let resolver = resolver(ResolverConfig::default(), None, None);
    let entry = MergeEntry::new(FEATURE_BRANCH, "bead-9", "alice", vec!["blob.bin".to_string()]);
    let result = resolver.resolve(entry, "main", &repo.path).await.unwrap();

    assert!(result.success);
    assert_eq!(result.tier, Some(Tier::AutoResolve));
    assert_eq!(result.conflict_files, vec!["blob.bin".to_string()]);
    assert_eq!(repo.read_bytes("blob.bin").unwrap(), incoming);
    assert_eq!(
        repo.git(&["rev-parse", "HEAD:blob.bin"]),
        repo.git(&["rev-parse", "feature:blob.bin"])
    );
    assert_eq!(repo.head_parents(), 2);
    assert_eq!(repo.status(), "");
}

#[tokio::test]
async fn test_dirty_tree_is_precondition_error() {
    let repo = TestRepo::with_line_conflict();
    let before = repo.head();
    repo.write(SHARED_FILE, "local edit\n");
    let knowledge = MemoryKnowledge::new();
    let resolver = resolver(ResolverConfig::default(), None, Some(knowledge.clone()));

    // an unknown branch would otherwise abort the merge with a hard reset
    let entry = MergeEntry::new("gone", "bead-9", "alice", vec![]);
    let err = resolver.resolve(entry, "main", &repo.path).await.unwrap_err();
    resolver.flush_records().await;

    match err {
        Error::Precondition { branch, reason } => {
            assert_eq!(branch, "main");
            assert!(reason.contains(SHARED_FILE), "{reason}");
        }
        other => panic!("expected precondition error, got {other:?}"),
    }
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some("local edit\n"));
    assert_eq!(repo.head(), before);
    assert!(knowledge.records().is_empty());
}

#[tokio::test]
async fn test_dirty_tree_blocks_fast_forward() {
    let repo = TestRepo::new();
    repo.commit_file(SHARED_FILE, "original line\n", "Add shared file");
    repo.checkout_new(FEATURE_BRANCH);
    repo.commit_file(SHARED_FILE, "feature line\n", "Feature edits shared");
    repo.checkout("main");
    let before = repo.head();
    repo.write(SHARED_FILE, "local edit\n");

    let resolver = resolver(ResolverConfig::default(), None, None);
    let err = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Precondition { .. }));
    assert_eq!(repo.read(SHARED_FILE).as_deref(), Some("local edit\n"));
    assert_eq!(repo.head(), before);
}

#[tokio::test]
async fn test_merge_in_progress_is_precondition_error() {
    let repo = TestRepo::with_line_conflict();
    assert!(!repo.git_status_ok(&["merge", "-q", FEATURE_BRANCH]));
    assert!(repo.path.join(".git/MERGE_HEAD").exists());
    let assistant = ScriptedAssistant::always(VALID_CODE);
    let resolver = resolver(ai_only(), Some(assistant.clone()), None);

    let err = resolver
        .resolve(feature_entry(), "main", &repo.path)
        .await
        .unwrap_err();

    match err {
        Error::Precondition { reason, .. } => assert!(reason.contains("in progress"), "{reason}"),
        other => panic!("expected precondition error, got {other:?}"),
    }
    assert_eq!(assistant.calls(), 0);
    assert!(repo.path.join(".git/MERGE_HEAD").exists());
}

#[tokio::test]
async fn test_unknown_branch_fails_without_touching_untracked_files() {
    let repo = TestRepo::with_line_conflict();
    let before = repo.head();
    repo.write("notes.txt", "scratch\n");
    let resolver = resolver(ResolverConfig::default(), None, None);

    let entry = MergeEntry::new("gone", "bead-9", "alice", vec![]);
    let result = resolver.resolve(entry, "main", &repo.path).await.unwrap();

    assert!(!result.success);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("clean-merge failed"));
    assert_eq!(repo.head(), before);
    assert_eq!(repo.read("notes.txt").as_deref(), Some("scratch\n"));
    assert_eq!(repo.status(), "?? notes.txt");
}
