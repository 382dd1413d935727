//! # Doc Governance CLI (`dgov`)
//!
//! The `dgov` binary drives the tiered governance pipeline: ingest documents
//! into the Raw tier, advance them through Enriched and Indexed, and query
//! the Indexed tier through the access filter.
//!
//! ## Usage
//!
//! ```bash
//! dgov --config ./config/dgov.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dgov init` | Create the store and its schema |
//! | `dgov ingest <file>` | Upload one document with optional attribute overrides |
//! | `dgov sync` | Bulk-sync the configured filesystem connector into Raw |
//! | `dgov process <stage>` | Run `enrich`, `index`, or `all` stages |
//! | `dgov query [text]` | Search the Indexed tier as a caller with the given levels |
//! | `dgov get <tier> <id>` | Print one document from a tier |
//! | `dgov failures` | List the failure ledger |
//! | `dgov status` | Per-tier document counts |
//! | `dgov audit [id]` | Check classification invariants across tiers |
//! | `dgov purge <id>` | Remove a document from every tier |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use doc_governance::access::{AccessFilter, Authorization, Query};
use doc_governance::config::{self, Config};
use doc_governance::connector_fs;
use doc_governance::error::GovernanceError;
use doc_governance::ingest::{IngestOptions, Ingestor};
use doc_governance::logging;
use doc_governance::metadata::{parse_attribute_pairs, MetadataDefaults, Synthesizer};
use doc_governance::models::{Representation, Tier};
use doc_governance::pipeline::{Pipeline, StageReport};
use doc_governance::progress::{ProgressMode, SharedProgress};
use doc_governance::representation::create_generator;
use doc_governance::store::{open_store, Store};

/// Doc Governance CLI: classification-preserving ingestion, enrichment,
/// indexing and access-filtered retrieval.
#[derive(Parser)]
#[command(
    name = "dgov",
    about = "Tiered document governance: ingest, enrich, index and query with classification preserved",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dgov.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and its schema. Idempotent.
    Init,

    /// Upload one document into the Raw tier.
    Ingest {
        /// File whose bytes become the document payload.
        file: PathBuf,

        /// Metadata override as `key=value` (repeatable), e.g.
        /// `--attr confidentiality_level=internal --attr tags=hr,payroll`.
        #[arg(long = "attr", value_parser = parse_key_val)]
        attrs: Vec<(String, String)>,

        /// Source-system classification hint; the stricter of hint and
        /// attribute wins.
        #[arg(long)]
        hint: Option<String>,

        /// Authorize lowering an existing classification.
        #[arg(long)]
        allow_downgrade: bool,
    },

    /// Bulk-sync the filesystem connector into the Raw tier.
    ///
    /// Unchanged files are skipped. A file whose level comes from a
    /// companion or the connector hint may not fall below the level any
    /// tier holds for it; a file left to defaults is only held to its Raw
    /// record, and the classification policy re-evaluates its new content.
    Sync {
        /// Authorize lowering existing classifications.
        #[arg(long)]
        allow_downgrade: bool,
    },

    /// Advance documents through the stage processors.
    Process {
        #[arg(value_enum)]
        stage: StageArg,
    },

    /// Search the Indexed tier through the access filter.
    ///
    /// Without any `--level`, the caller's authorization is indeterminate
    /// and nothing is returned.
    Query {
        /// Keyword query. Omit to list every visible chunk.
        text: Option<String>,

        /// Classification level the caller may see (repeatable).
        #[arg(long = "level")]
        levels: Vec<String>,

        #[arg(long = "type")]
        document_type: Option<String>,

        #[arg(long)]
        source: Option<String>,

        /// Required tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Rank by vector similarity using the configured generator.
        #[arg(long)]
        semantic: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print one document from a tier.
    ///
    /// Reads of the Indexed tier go through the access filter and need
    /// `--level`.
    Get {
        tier: String,
        doc_id: String,
        #[arg(long = "level")]
        levels: Vec<String>,
    },

    /// List documents that failed to advance.
    Failures,

    /// Per-tier document counts.
    Status,

    /// Check classification invariants for one document, or all of them.
    Audit { doc_id: Option<String> },

    /// Remove a document and its metadata from every tier.
    Purge { doc_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    Enrich,
    Index,
    All,
}

/// Parse a `key=value` pair for `--attr` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json);

    let progress_mode = match cli.progress {
        Some(ProgressArg::Off) => ProgressMode::Off,
        Some(ProgressArg::Human) => ProgressMode::Human,
        Some(ProgressArg::Json) => ProgressMode::Json,
        None => ProgressMode::default_for_tty(),
    };
    let progress = progress_mode.reporter();

    let cfg = config::load_config(&cli.config)?;
    debug!(config = %cli.config.display(), backend = %cfg.store.backend, "configuration loaded");
    let store = open_store(&cfg.store).await?;

    let result = run_command(cli.command, &cfg, store.clone(), progress).await;
    store.close().await;
    result
}

async fn run_command(
    command: Commands,
    cfg: &Config,
    store: Arc<dyn Store>,
    progress: SharedProgress,
) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Store initialized ({} backend at {}).",
                cfg.store.backend,
                cfg.store.path.display()
            );
        }
        Commands::Ingest {
            file,
            attrs,
            hint,
            allow_downgrade,
        } => {
            run_ingest(cfg, store, &file, &attrs, hint.as_deref(), allow_downgrade).await?;
        }
        Commands::Sync { allow_downgrade } => {
            run_sync(cfg, store, allow_downgrade, &progress).await?;
        }
        Commands::Process { stage } => {
            run_process(cfg, store, stage, progress).await?;
        }
        Commands::Query {
            text,
            levels,
            document_type,
            source,
            tags,
            limit,
            semantic,
            json,
        } => {
            let mut query = Query {
                text,
                document_type,
                source,
                tags: tags.into_iter().collect(),
                vector: None,
                limit,
            };
            if semantic {
                query.vector = Some(embed_query(cfg, query.text.as_deref()).await?);
            }
            run_query(store, &levels, &query, json).await?;
        }
        Commands::Get {
            tier,
            doc_id,
            levels,
        } => {
            run_get(store, &tier, &doc_id, &levels).await?;
        }
        Commands::Failures => {
            let failures = store.list_failures().await?;
            if failures.is_empty() {
                println!("No recorded failures.");
            }
            for f in failures {
                println!(
                    "{}  {}  attempts={}  {}  {}",
                    f.doc_id,
                    f.tier,
                    f.attempts,
                    f.failed_at.to_rfc3339(),
                    f.reason
                );
            }
        }
        Commands::Status => {
            let pipeline = Pipeline::from_config(cfg, store)?;
            let status = pipeline.status().await?;
            println!("raw:       {}", status.raw);
            println!("enriched:  {}  ({} pending)", status.enriched, status.pending_enrich);
            println!("indexed:   {}  ({} pending)", status.indexed, status.pending_index);
            println!("failures:  {}", status.failures);
        }
        Commands::Audit { doc_id } => {
            run_audit(cfg, store, doc_id.as_deref()).await?;
        }
        Commands::Purge { doc_id } => {
            let pipeline = Pipeline::from_config(cfg, store)?;
            let report = pipeline.purge(&doc_id).await?;
            if report.removed_from.is_empty() {
                println!("{} not found in any tier.", doc_id);
            } else {
                let tiers: Vec<&str> = report.removed_from.iter().map(Tier::as_str).collect();
                println!("Purged {} from {}.", doc_id, tiers.join(", "));
            }
        }
    }

    Ok(())
}

fn ingestor(cfg: &Config, store: Arc<dyn Store>) -> anyhow::Result<Ingestor> {
    let defaults = MetadataDefaults::from_config(&cfg.metadata)?;
    Ok(Ingestor::new(store, Synthesizer::new(defaults)))
}

async fn run_ingest(
    cfg: &Config,
    store: Arc<dyn Store>,
    file: &Path,
    attrs: &[(String, String)],
    hint: Option<&str>,
    allow_downgrade: bool,
) -> anyhow::Result<()> {
    let payload =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let partial = parse_attribute_pairs(attrs)?;
    let options = IngestOptions { allow_downgrade };
    let ingestor = ingestor(cfg, store)?;

    let receipt = match hint {
        Some(h) => ingestor.ingest_synced(Some(&payload[..]), &partial, Some(h), options).await?,
        None => ingestor.ingest(Some(&payload[..]), &partial, options).await?,
    };
    if let Some(meta) = &receipt.metadata {
        println!(
            "Ingested {} ({}) -> {}{}",
            receipt.doc_id,
            meta.confidentiality_level,
            meta.storage_path,
            if receipt.unchanged {
                " [unchanged]"
            } else if receipt.replaced {
                " [replaced]"
            } else {
                ""
            }
        );
    }
    if receipt.downgraded {
        println!("Classification lowered under explicit authorization.");
    }
    Ok(())
}

async fn run_sync(
    cfg: &Config,
    store: Arc<dyn Store>,
    allow_downgrade: bool,
    progress: &SharedProgress,
) -> anyhow::Result<()> {
    let fs_config = cfg
        .connectors
        .filesystem
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Filesystem connector not configured"))?;
    let ingestor = ingestor(cfg, store)?;
    let report = connector_fs::run_sync(
        &ingestor,
        fs_config,
        IngestOptions { allow_downgrade },
        progress,
    )
    .await?;

    println!(
        "sync filesystem: {} scanned, {} written ({} without metadata), {} unchanged, {} rejected",
        report.scanned,
        report.written,
        report.unlabeled,
        report.unchanged,
        report.rejected.len()
    );
    for (path, reason) in &report.rejected {
        println!("  rejected {}: {}", path, reason);
    }
    Ok(())
}

async fn run_process(
    cfg: &Config,
    store: Arc<dyn Store>,
    stage: StageArg,
    progress: SharedProgress,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(cfg, store)?.with_progress(progress);
    match stage {
        StageArg::Enrich => print_stage(&pipeline.enricher().run().await?),
        StageArg::Index => print_stage(&pipeline.indexer().run().await?),
        StageArg::All => {
            let report = pipeline.run_all().await?;
            print_stage(&report.enrich);
            print_stage(&report.index);
        }
    }
    Ok(())
}

fn print_stage(report: &StageReport) {
    println!(
        "{}: {} discovered, {} advanced, {} chunks, {} tightened, {} invalid, {} errors{}",
        report.stage,
        report.discovered,
        report.advanced,
        report.chunks_written,
        report.tightened,
        report.invalid,
        report.errors,
        if report.timed_out { " (timed out)" } else { "" }
    );
}

async fn embed_query(cfg: &Config, text: Option<&str>) -> anyhow::Result<Vec<f32>> {
    let text = text.ok_or_else(|| anyhow::anyhow!("--semantic requires query text"))?;
    let generator = create_generator(&cfg.representation)?;
    let mut out = generator.represent(&[text.to_string()]).await?;
    match out.pop() {
        Some(Representation::Vector(v)) => Ok(v),
        _ => bail!(
            "representation provider '{}' does not produce vectors",
            generator.name()
        ),
    }
}

async fn run_query(
    store: Arc<dyn Store>,
    levels: &[String],
    query: &Query,
    json: bool,
) -> anyhow::Result<()> {
    let auth = Authorization::from_names(levels);
    let hits = AccessFilter::new(store).search(&auth, query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}#{} ({}, {})",
            i + 1,
            hit.score,
            hit.doc_id,
            hit.chunk_index,
            hit.metadata.confidentiality_level,
            hit.metadata.title.as_deref().unwrap_or("untitled")
        );
        println!("    {}", hit.snippet.replace('\n', " "));
    }
    Ok(())
}

async fn run_get(
    store: Arc<dyn Store>,
    tier: &str,
    doc_id: &str,
    levels: &[String],
) -> anyhow::Result<()> {
    let tier: Tier = tier.parse()?;

    if tier == Tier::Indexed {
        let auth = Authorization::from_names(levels);
        let hits = AccessFilter::new(store)
            .fetch(&auth, doc_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound {
                tier,
                doc_id: doc_id.to_string(),
            })?;
        if let Some(first) = hits.first() {
            println!("{}", serde_json::to_string_pretty(&first.metadata)?);
        }
        for hit in &hits {
            println!("--- chunk {} ---", hit.chunk_index);
            println!("{}", hit.snippet);
        }
        return Ok(());
    }

    let doc = store.get(tier, doc_id).await?;
    match doc.primary().1 {
        Some(meta) => println!("{}", serde_json::to_string_pretty(meta)?),
        None => println!("(no metadata record; defaults are applied by the enrich stage)"),
    }
    for entry in &doc.entries {
        println!("--- {} {} ---", tier, entry.index);
        println!("{}", String::from_utf8_lossy(&entry.content));
    }
    Ok(())
}

async fn run_audit(cfg: &Config, store: Arc<dyn Store>, doc_id: Option<&str>) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(cfg, store)?;
    let reports = match doc_id {
        Some(id) => vec![pipeline.audit(id).await?],
        None => pipeline.audit_all().await?,
    };

    let mut violating = 0;
    for report in &reports {
        let tiers: Vec<String> = report
            .tiers
            .iter()
            .map(|t| {
                format!(
                    "{}={}x{}",
                    t.tier,
                    t.level.map(|l| l.as_str()).unwrap_or("unlabeled"),
                    t.entries
                )
            })
            .collect();
        let state = if !report.is_clean() {
            "VIOLATION"
        } else if report.stale {
            "stale"
        } else {
            "ok"
        };
        println!("{}  {}  {}", report.doc_id, state, tiers.join(" "));
        for v in &report.violations {
            println!("    {}", v);
        }
        if !report.is_clean() {
            violating += 1;
        }
    }

    if violating > 0 {
        bail!("{} document(s) violate tier invariants", violating);
    }
    Ok(())
}
