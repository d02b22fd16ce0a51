use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobscout_core::{find_duplicates, SimilarityQuery, DEFAULT_DEDUP_THRESHOLD};
use jobscout_notion::{NotionClient, NotionConfig, RetryPolicy};
use jobscout_storage::CatalogStore;
use jobscout_sync::{
    apply_analyses, pending_analysis, resolve_collection_id, ExtractiveSummarizer,
    ReconcileEngine, Summarizer, SyncMode, SyncOptions, DEFAULT_CONCURRENCY,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "Job-search catalog tools: duplicate screening and tracker sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Query the catalog for near-duplicate listings.
    ///
    /// Exits 0 when any match is found, 1 when none is, 2 when the catalog
    /// cannot be loaded.
    Dedup {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long, default_value = "")]
        company: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        salary: String,
        #[arg(long, default_value = "")]
        location: String,
        /// JD text to compare (full text or summary).
        #[arg(long, default_value = "")]
        jd: String,
        /// Distance-rate threshold; matches fall strictly below it.
        #[arg(long, default_value_t = DEFAULT_DEDUP_THRESHOLD)]
        threshold: f64,
    },
    /// Reconcile the catalog against the tracker collection.
    ///
    /// Exits 0 when every record succeeded, 1 otherwise.
    Sync {
        #[arg(long)]
        catalog: PathBuf,
        /// Collection id or share link. Falls back to the preference file,
        /// then to an interactive prompt.
        #[arg(long)]
        db_id: Option<String>,
        /// create (alias: new), update, full (alias: all), or reset.
        #[arg(long, default_value = "create")]
        mode: SyncMode,
        /// Only process records whose company contains this string.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
        /// Preference file holding notion_db_id. Defaults to
        /// internship-prefs.md next to the catalog.
        #[arg(long)]
        prefs: Option<PathBuf>,
    },
    /// Fill missing jd_summary fields with the deterministic extractive
    /// summarizer.
    Summarize {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long, default_value_t = 30)]
        min_len: usize,
        #[arg(long, default_value_t = 50)]
        max_len: usize,
        /// Re-process records that already have a summary.
        #[arg(long)]
        refetch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Dedup {
            catalog,
            company,
            title,
            salary,
            location,
            jd,
            threshold,
        } => {
            let query = SimilarityQuery {
                company,
                title,
                salary,
                location,
                description: jd,
                threshold,
            };
            run_dedup(&catalog, &query);
        }
        Commands::Sync {
            catalog,
            db_id,
            mode,
            filter,
            dry_run,
            concurrency,
            prefs,
        } => {
            let code = run_sync(&catalog, db_id, mode, filter, dry_run, concurrency, prefs).await?;
            std::process::exit(code);
        }
        Commands::Summarize {
            catalog,
            min_len,
            max_len,
            refetch,
        } => {
            run_summarize(&catalog, min_len, max_len, refetch)?;
        }
    }
    Ok(())
}

fn run_dedup(catalog_path: &PathBuf, query: &SimilarityQuery) -> ! {
    let catalog = match CatalogStore::new(catalog_path).load() {
        Ok(catalog) => catalog,
        // absent or unreadable catalog is distinct from "no matches"
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let matches = find_duplicates(&catalog.records, query);
    if matches.is_empty() {
        println!("no duplicates found");
        std::process::exit(1);
    }

    println!("found {} suspected duplicate(s):\n", matches.len());
    for m in &matches {
        let record = &catalog.records[m.index];
        println!(
            "  index={}  score={:.3}  distance={:.3}",
            m.index, m.score, m.distance_rate
        );
        println!("    company: {}  title: {}", record.company, record.title);
        println!("    salary: {}  location: {}", record.salary, record.location);
        println!(
            "    status: {}  collected: {}",
            record.status, record.collected_at
        );
        println!();
    }
    std::process::exit(0);
}

async fn run_sync(
    catalog_path: &PathBuf,
    db_id: Option<String>,
    mode: SyncMode,
    filter: Option<String>,
    dry_run: bool,
    concurrency: usize,
    prefs: Option<PathBuf>,
) -> Result<i32> {
    // credentials are checked before any other work
    let config = NotionConfig::from_env()?;
    let client = Arc::new(NotionClient::new(config)?);

    let prefs_path = prefs.unwrap_or_else(|| {
        catalog_path
            .parent()
            .map(|dir| dir.join("internship-prefs.md"))
            .unwrap_or_else(|| PathBuf::from("internship-prefs.md"))
    });
    let collection_id = resolve_collection_id(db_id.as_deref(), &prefs_path, client.as_ref())
        .await
        .context("resolving tracker collection")?;

    let catalog_store = CatalogStore::new(catalog_path);
    let mut catalog = catalog_store.load()?;

    println!(
        "collection: {collection_id} | mode: {mode} | records: {}{}",
        catalog.records.len(),
        if dry_run { " [dry-run]" } else { "" }
    );

    let engine = ReconcileEngine::new(
        client,
        SyncOptions {
            mode,
            filter,
            dry_run,
            concurrency,
            retry: RetryPolicy::default(),
        },
    );
    let report = engine
        .run(&catalog_store, &mut catalog, &collection_id)
        .await?;

    for plan in &report.planned {
        println!("[dry-run] {plan}");
    }
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("ok {} | {}", outcome.company, outcome.action),
            Some(reason) => println!("failed {} | {reason}", outcome.company),
        }
    }
    for (page_id, reason) in &report.archive_failures {
        println!("failed archive {page_id} | {reason}");
    }
    if report.archived > 0 {
        println!("archived {} external page(s)", report.archived);
    }
    println!(
        "done: created={} updated={} failures={}",
        report.created(),
        report.updated(),
        report.failures()
    );

    Ok(if report.succeeded() { 0 } else { 1 })
}

fn run_summarize(
    catalog_path: &PathBuf,
    min_len: usize,
    max_len: usize,
    refetch: bool,
) -> Result<()> {
    let catalog_store = CatalogStore::new(catalog_path);
    let mut catalog = catalog_store.load()?;

    let indices = pending_analysis(&catalog.records, refetch);
    if indices.is_empty() {
        println!("summarized=0");
        return Ok(());
    }

    let batch: Vec<_> = indices
        .iter()
        .map(|&i| catalog.records[i].clone())
        .collect();
    let summarizer = ExtractiveSummarizer { min_len, max_len };
    let analyses = summarizer.summarize(&batch)?;
    apply_analyses(&mut catalog.records, &indices, &analyses);
    catalog_store.save(&catalog)?;

    println!("summarized={}", analyses.len());
    Ok(())
}
