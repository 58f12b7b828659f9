use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tally_core::TransactionId;
use tally_import::{
    apply_resolutions, read_source, restore_resolutions, to_csv, to_xlsx, DuplicateCluster, EngineConfig, ImportEngine,
    MappingDecision, Resolution, SourceFile,
};
use tally_storage::{SqliteStore, TransactionStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally", version, about = "Import, normalize and deduplicate financial transactions")]
struct Cli {
    /// Database file holding every user's transactions.
    #[arg(long, global = true, default_value = "tally.db")]
    db: PathBuf,
    /// Engine settings (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "default")]
    user: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import files into the user's set and report rejects and duplicates.
    Import {
        files: Vec<PathBuf>,
        /// JSON object of file id to mapping decisions, for files whose mapping needs confirmation.
        #[arg(long)]
        decisions: Option<PathBuf>,
    },
    /// Write the user's set to a file.
    Export {
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Csv)]
        format: Format,
    },
    /// List near-duplicate clusters in the user's set.
    Duplicates,
    /// Resolve one duplicate cluster and save the result.
    Resolve(ResolveArgs),
    /// Show the user's upload history.
    History,
    /// List users with stored data.
    Users,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Xlsx,
}

#[derive(Args)]
struct ResolveArgs {
    cluster: String,
    /// Keep this member and remove the others.
    #[arg(long, conflicts_with_all = ["keep_all", "discard"])]
    merge: Option<String>,
    /// Mark the cluster as not duplicates.
    #[arg(long, conflicts_with = "discard")]
    keep_all: bool,
    /// Remove these members.
    #[arg(long, num_args = 1..)]
    discard: Vec<String>,
}

impl ResolveArgs {
    fn resolution(&self) -> Result<Resolution> {
        if let Some(keep) = &self.merge {
            return Ok(Resolution::Merged {
                keep: TransactionId(keep.clone()),
            });
        }
        if self.keep_all {
            return Ok(Resolution::KeptAll);
        }
        if !self.discard.is_empty() {
            return Ok(Resolution::Discarded {
                ids: self.discard.iter().cloned().map(TransactionId).collect(),
            });
        }
        bail!("one of --merge, --keep-all or --discard is required")
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Clusters in the user's stored set, with earlier decisions re-attached.
async fn stored_clusters(engine: &ImportEngine, store: &SqliteStore, user: &str) -> Result<Vec<DuplicateCluster>> {
    let txs = store.load(user).await?;
    let mut clusters = engine.detector().detect(&txs);
    let recorded = store.load_resolutions(user).await?;
    restore_resolutions(&mut clusters, &recorded);
    Ok(clusters)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::load(p).with_context(|| format!("Failed to load config {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn import(
    engine: &ImportEngine,
    store: &SqliteStore,
    user: &str,
    files: &[PathBuf],
    decisions: Option<&Path>,
) -> Result<()> {
    let decisions: HashMap<String, Vec<MappingDecision>> = match decisions {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("Failed to read {}", p.display()))?;
            serde_json::from_str(&text).context("Invalid decisions file")?
        }
        None => HashMap::new(),
    };

    let mut sources: Vec<SourceFile> = Vec::new();
    let mut unreadable = Vec::new();
    for path in files {
        match read_source(path, &engine.config().reader).await {
            Ok(source) => sources.push(source),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Could not read file");
                unreadable.push(json!({ "file_id": path.display().to_string(), "error": e.to_string() }));
            }
        }
    }

    let prior = store.load(user).await.context("Failed to load stored transactions")?;
    let templates = store.load_templates(user).await.context("Failed to load mapping templates")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling import");
            ctrl_c.cancel();
        }
    });

    let mut outcome = engine.import_batch(sources, &prior, &templates, cancel).await;
    if outcome.cancelled {
        bail!("Import cancelled; stored transactions are unchanged");
    }

    // Files confirmed from the decisions file are merged after the batch.
    let mut still_pending = Vec::new();
    let mut late = Vec::new();
    for staged in std::mem::take(&mut outcome.pending) {
        match decisions.get(&staged.file_id) {
            Some(list) => {
                let mapping = staged
                    .proposal
                    .clone()
                    .confirm(list)
                    .with_context(|| format!("Invalid mapping decisions for {}", staged.file_id))?;
                late.push(engine.ingest(&staged, mapping));
            }
            None => still_pending.push(staged),
        }
    }
    if !late.is_empty() {
        let extra = late.iter().flat_map(|f| f.report.accepted.iter().cloned()).collect();
        let second = engine.merge(&outcome.merged.transactions, extra);
        outcome.merged.clusters.extend(second.clusters);
        outcome.merged.superseded += second.superseded;
        outcome.merged.transactions = second.transactions;
        outcome.imported.extend(late);
    }

    // Rows that come back after an earlier merge or discard are removed again.
    let recorded = store.load_resolutions(user).await.context("Failed to load cluster resolutions")?;
    if restore_resolutions(&mut outcome.merged.clusters, &recorded) > 0 {
        outcome.merged.transactions = apply_resolutions(&outcome.merged.transactions, &outcome.merged.clusters)
            .context("Failed to re-apply recorded resolutions")?;
    }

    store
        .save(user, &outcome.merged.transactions)
        .await
        .context("Failed to save transactions")?;
    for file in &outcome.imported {
        store.record_import(user, &file.summary).await?;
        store
            .save_template(user, file.mapping.layout_key(), file.mapping.mapping())
            .await?;
    }
    info!(user, total = outcome.merged.transactions.len(), "Import saved");

    let failed: Vec<_> = outcome
        .failed
        .iter()
        .map(|e| json!({ "file_id": e.file_id, "error": e.error.to_string() }))
        .chain(unreadable)
        .collect();
    let rejects: Vec<_> = outcome
        .imported
        .iter()
        .flat_map(|f| f.report.rejected.iter().map(move |r| json!({ "file_id": f.summary.file_id, "reject": r })))
        .collect();
    print_json(&json!({
        "imported": outcome.imported.iter().map(|f| &f.summary).collect::<Vec<_>>(),
        "rejected": rejects,
        "pending": still_pending.iter().map(|s| &s.proposal).collect::<Vec<_>>(),
        "failed": failed,
        "duplicates": outcome.merged.clusters,
        "total": outcome.merged.transactions.len(),
    }))
}

async fn run(cli: Cli) -> Result<()> {
    let engine = ImportEngine::new(load_config(cli.config.as_deref())?);
    let store = SqliteStore::open(&cli.db)
        .await
        .with_context(|| format!("Failed to open database {}", cli.db.display()))?;
    let user = cli.user.as_str();

    match cli.command {
        Command::Import { files, decisions } => {
            if files.is_empty() {
                bail!("no input files given");
            }
            import(&engine, &store, user, &files, decisions.as_deref()).await
        }
        Command::Export { out, format } => {
            let txs = store.load(user).await?;
            let bytes = match format {
                Format::Csv => to_csv(&txs)?,
                Format::Xlsx => to_xlsx(&txs)?,
            };
            tokio::fs::write(&out, bytes)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!(rows = txs.len(), out = %out.display(), "Exported");
            Ok(())
        }
        Command::Duplicates => print_json(&json!(stored_clusters(&engine, &store, user).await?)),
        Command::Resolve(args) => {
            let resolution = args.resolution()?;
            let mut cluster = stored_clusters(&engine, &store, user)
                .await?
                .into_iter()
                .find(|c| c.id == args.cluster)
                .with_context(|| format!("No duplicate cluster '{}'", args.cluster))?;
            cluster
                .resolve(resolution)
                .with_context(|| format!("Cannot resolve cluster '{}'", cluster.id))?;
            let txs = store.load(user).await?;
            let updated = cluster.apply_resolution(&txs)?;
            store.save(user, &updated).await?;
            store.save_resolution(user, &cluster.id, &cluster.resolution).await?;
            info!(cluster = %cluster.id, removed = txs.len() - updated.len(), "Resolved cluster");
            print_json(&json!(cluster))
        }
        Command::History => print_json(&json!(store.import_history(user).await?)),
        Command::Users => print_json(&json!(store.list_users().await?)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await
}
