use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use mergeq::config::Config;
use mergeq::drain::Drainer;
use mergeq::knowledge::{GitNotesKnowledge, KnowledgeStore};
use mergeq::queue::{EntryId, MergeEntry, MergeQueue};
use mergeq::resolution::{CodeAssistant, CommandAssistant, ConflictResolver, MergeResult};
use mergeq::{mlog, mlog_warn, Error, Result};

/// mergeq - land agent branches on the canonical branch, escalating through
/// conflict-resolution tiers
#[derive(Parser, Debug)]
#[command(name = "mergeq")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MERGEQ_DEBUG=1  Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.mergeq/mergeq.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Queue file (default from config, else ~/.mergeq/queue.json)
    #[arg(long, global = true)]
    pub queue: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Add a branch to the merge queue
    Enqueue {
        /// Branch to land
        branch: String,

        /// Task id the branch was produced for
        #[arg(long)]
        bead: String,

        /// Agent that produced the branch
        #[arg(long)]
        agent: String,

        /// File the agent modified (repeatable)
        #[arg(long = "file", short = 'f')]
        files: Vec<String>,
    },

    /// Show queued entries
    List {
        /// Only pending entries
        #[arg(long)]
        pending: bool,
    },

    /// Resolve pending entries into a repository
    Drain {
        /// Repository to merge into
        #[arg(long, short = 'C', default_value = ".")]
        repo: PathBuf,

        /// Canonical branch (default from config, else main)
        #[arg(long)]
        canonical: Option<String>,

        /// Enable the ai-resolve tier for this run
        #[arg(long)]
        ai_resolve: bool,

        /// Enable the reimagine tier for this run
        #[arg(long)]
        reimagine: bool,

        /// Resolve a single entry and stop
        #[arg(long)]
        once: bool,
    },

    /// Send a failed entry back to pending
    Requeue {
        /// Entry id or its 8-character prefix
        id: String,
    },

    /// Remove entries from the queue
    Purge {
        /// Entry id or prefix; omit with --finished to drop all merged/failed
        id: Option<String>,

        /// Drop every merged or failed entry
        #[arg(long)]
        finished: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    mergeq::log::init(cli.debug);

    let config = Config::load()?;
    let queue_path = match &cli.queue {
        Some(path) => path.clone(),
        None => config.queue_path()?,
    };
    mlog!("mergeq {:?} queue={}", cli.command, queue_path.display());

    match cli.command {
        Command::Enqueue {
            branch,
            bead,
            agent,
            files,
        } => run_enqueue(&queue_path, branch, bead, agent, files),
        Command::List { pending } => run_list(&queue_path, pending),
        Command::Drain {
            repo,
            canonical,
            ai_resolve,
            reimagine,
            once,
        } => {
            let canonical =
                canonical.unwrap_or_else(|| config.effective_canonical_branch().to_string());
            let mut resolver_config = config.resolver_config();
            resolver_config.ai_resolve |= ai_resolve;
            resolver_config.reimagine |= reimagine;

            let resolver = build_resolver(&config, resolver_config, &repo);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_drain(&queue_path, resolver, &repo, &canonical, once))
        }
        Command::Requeue { id } => run_requeue(&queue_path, &id),
        Command::Purge { id, finished } => run_purge(&queue_path, id.as_deref(), finished),
    }
}

fn run_enqueue(
    queue_path: &Path,
    branch: String,
    bead: String,
    agent: String,
    files: Vec<String>,
) -> Result<()> {
    let mut queue = MergeQueue::open_sync(queue_path)?;
    let id = queue.enqueue(MergeEntry::new(branch.clone(), bead, agent, files));
    queue.save_sync()?;
    println!("Queued {} as {}", branch, id.short());
    Ok(())
}

fn run_list(queue_path: &Path, pending_only: bool) -> Result<()> {
    let queue = MergeQueue::open_sync(queue_path)?;
    let entries: Vec<&MergeEntry> = if pending_only {
        queue.pending()
    } else {
        queue.list().iter().collect()
    };

    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!(
        "{:<10} {:<8} {:<13} {:<14} {:<30} ENQUEUED",
        "ID", "STATUS", "TIER", "AGENT", "BRANCH"
    );
    for entry in entries {
        println!(
            "{:<10} {:<8} {:<13} {:<14} {:<30} {}",
            entry.id.short(),
            entry.status(),
            entry
                .resolved_tier()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            truncate_string(&entry.agent_name, 14),
            truncate_string(&entry.branch_name, 30),
            entry.enqueued_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn build_resolver(
    config: &Config,
    resolver_config: mergeq::resolution::ResolverConfig,
    repo: &Path,
) -> ConflictResolver {
    let mut resolver = ConflictResolver::new(resolver_config);

    if resolver_config.ai_resolve || resolver_config.reimagine {
        match CommandAssistant::from_command(config.effective_assistant_command()) {
            Ok(assistant) => {
                let assistant: Arc<dyn CodeAssistant> =
                    Arc::new(assistant.with_timeout(config.assistant_timeout()));
                resolver = resolver.with_assistant(assistant);
            }
            Err(e) => {
                mlog_warn!("No assistant, assistant tiers will be skipped: {}", e);
                eprintln!("Warning: {}; assistant tiers disabled", e);
            }
        }
    }

    match GitNotesKnowledge::new(repo) {
        Ok(store) => {
            let store: Arc<dyn KnowledgeStore> = Arc::new(store);
            resolver = resolver.with_knowledge(store);
        }
        Err(e) => mlog_warn!("Knowledge store unavailable, running without history: {}", e),
    }

    resolver
}

async fn run_drain(
    queue_path: &Path,
    resolver: ConflictResolver,
    repo: &Path,
    canonical: &str,
    once: bool,
) -> Result<()> {
    let queue = MergeQueue::open(queue_path).await?;
    let drainer = Drainer::new(Arc::new(resolver), Arc::new(Mutex::new(queue)));

    let results = if once {
        drainer
            .drain_once(repo, canonical)
            .await?
            .into_iter()
            .collect()
    } else {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted; finishing the current entry...");
                on_signal.cancel();
            }
        });
        drainer.run(repo, canonical, cancel).await?
    };

    if results.is_empty() {
        println!("Nothing to drain.");
    }
    for result in &results {
        print_result(result);
    }

    drainer.resolver().flush_records().await;
    Ok(())
}

fn print_result(result: &MergeResult) {
    let entry = &result.entry;
    match (result.success, result.tier) {
        (true, Some(tier)) => println!(
            "  merged  {} {} via {}",
            entry.id.short(),
            entry.branch_name,
            tier
        ),
        _ => println!(
            "  failed  {} {}: {}",
            entry.id.short(),
            entry.branch_name,
            result.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
    if !result.conflict_files.is_empty() {
        println!("          conflicts: {}", result.conflict_files.join(", "));
    }
}

fn resolve_id(queue: &MergeQueue, id: &str) -> Result<EntryId> {
    queue
        .find_by_prefix(id)
        .map(|e| e.id)
        .ok_or_else(|| Error::EntryNotFound(id.to_string()))
}

fn run_requeue(queue_path: &Path, id: &str) -> Result<()> {
    let mut queue = MergeQueue::open_sync(queue_path)?;
    let id = resolve_id(&queue, id)?;
    queue.requeue(id)?;
    queue.save_sync()?;
    println!("Requeued {}", id.short());
    Ok(())
}

fn run_purge(queue_path: &Path, id: Option<&str>, finished: bool) -> Result<()> {
    let mut queue = MergeQueue::open_sync(queue_path)?;
    let removed = match id {
        Some(id) => {
            let id = resolve_id(&queue, id)?;
            usize::from(queue.purge(id).is_some())
        }
        None if finished => queue.purge_finished(),
        None => {
            eprintln!("Nothing to purge: pass an entry id or --finished");
            return Ok(());
        }
    };
    queue.save_sync()?;
    println!("Purged {} entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
