use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reel_core::{Direction, ReconcileReport};
use reel_harvest::{CatalogHarvester, HarvestConfig, ProfileHarvester};
use reel_reconcile::Reconciler;
use reel_storage::{Checkpoint, PageFetcher, PgStore, TokioSleeper};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reel-cli")]
#[command(about = "Reel Signal command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk the film links file into the catalog store.
    HarvestCatalog {
        /// 1-based start index; defaults to resuming from the checkpoint.
        #[arg(long)]
        start: Option<usize>,
    },
    /// Scrape one user's film grid into a dated snapshot.
    HarvestProfile { username: String },
    /// Compare a user's latest snapshot against the catalog.
    Reconcile {
        username: String,
        /// Emit the full report as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Collect detail-page links from a public list into the links file.
    DiscoverLinks {
        /// List URL to walk page by page.
        #[arg(long)]
        url: String,
    },
    /// Write links that failed in past runs to a retries file.
    Retries {
        #[arg(long, default_value = "retries.txt")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command {
        Commands::HarvestCatalog { start } => harvest_catalog(&config, start).await,
        Commands::HarvestProfile { username } => harvest_profile(&config, &username).await,
        Commands::Reconcile { username, json } => reconcile(&config, &username, json).await,
        Commands::DiscoverLinks { url } => discover_links(&config, &url).await,
        Commands::Retries { out } => retries(&config, &out).await,
    }
}

async fn connect(config: &HarvestConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to database")
}

fn fetcher(config: &HarvestConfig) -> Result<Arc<PageFetcher>> {
    Ok(Arc::new(PageFetcher::new(
        &config.user_agent,
        config.http_timeout(),
    )?))
}

async fn harvest_catalog(config: &HarvestConfig, start: Option<usize>) -> Result<()> {
    let links = reel_harvest::load_links(&config.links_file)?;
    let store = Arc::new(PgStore::new(connect(config).await?));
    let harvester = CatalogHarvester::new(
        fetcher(config)?,
        store,
        Arc::new(TokioSleeper),
        Checkpoint::new(config.checkpoint_file.clone()),
        config.base_url.clone(),
    );

    let start = match start {
        Some(start) => start.max(1),
        None => harvester.resume_index().await?,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let summary = harvester.run(&links, start, &cancel).await?;
    println!(
        "catalog harvest complete: processed={} errors={}{}",
        summary.processed,
        summary.errors,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

async fn harvest_profile(config: &HarvestConfig, username: &str) -> Result<()> {
    let store = PgStore::new(connect(config).await?);
    let harvester = ProfileHarvester::new(
        fetcher(config)?,
        Arc::new(TokioSleeper),
        config.base_url.clone(),
    );

    let summary = reel_harvest::harvest_profile(&harvester, &store, username).await?;
    println!(
        "profile harvest complete: username={} films={} total={}",
        summary.username,
        summary.entries,
        summary
            .total_films
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    Ok(())
}

async fn reconcile(config: &HarvestConfig, username: &str, json: bool) -> Result<()> {
    let store = Arc::new(PgStore::new(connect(config).await?));
    let reconciler = Reconciler::new(store.clone(), store);

    match reconciler.reconcile(username).await? {
        None => {
            println!("no snapshot found for '{username}'; run harvest-profile first");
        }
        Some(report) if json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(report) => print_report(&report),
    }
    Ok(())
}

async fn discover_links(config: &HarvestConfig, url: &str) -> Result<()> {
    let fetcher = fetcher(config)?;
    let links = reel_harvest::discover_links(fetcher.as_ref(), &TokioSleeper, url).await?;
    std::fs::write(&config.links_file, links.join("\n"))
        .with_context(|| format!("writing {}", config.links_file.display()))?;
    println!(
        "{} links saved to {}",
        links.len(),
        config.links_file.display()
    );
    Ok(())
}

async fn retries(config: &HarvestConfig, out: &PathBuf) -> Result<()> {
    let checkpoint = Checkpoint::new(config.checkpoint_file.clone());
    match checkpoint.load().await? {
        None => println!("no checkpoint at {}", checkpoint.path().display()),
        Some(progress) => {
            let links = progress.failed_links();
            std::fs::write(out, links.join("\n"))
                .with_context(|| format!("writing {}", out.display()))?;
            println!("{} failed links written to {}", links.len(), out.display());
        }
    }
    Ok(())
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Higher => "higher",
        Direction::Lower => "lower",
        Direction::Same => "same",
    }
}

fn print_report(report: &ReconcileReport) {
    println!(
        "Profile: {}  |  Films: {}  |  Scraped: {}\n",
        report.username,
        report
            .total_films
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        report.scraped_date
    );
    println!("Matched {} rated films in the database\n", report.matched);

    println!(
        "{:<45} {:>6} {:>5} {:>7}  Direction",
        "Title", "Yours", "DB", "Diff"
    );
    println!("{}", "-".repeat(75));
    for row in &report.rows {
        let title: String = row.title.chars().take(44).collect();
        println!(
            "{:<45} {:>6.1} {:>5.1} {:>+7.2}  {}",
            title,
            row.user_rating,
            row.catalog_rating,
            row.diff,
            direction_label(row.direction)
        );
    }

    let higher = report
        .rows
        .iter()
        .filter(|r| r.direction == Direction::Higher)
        .count();
    let lower = report
        .rows
        .iter()
        .filter(|r| r.direction == Direction::Lower)
        .count();
    let same = report
        .rows
        .iter()
        .filter(|r| r.direction == Direction::Same)
        .count();
    println!(
        "\nTotal compared: {}  |  Higher: {}  Lower: {}  Same: {}",
        report.rows.len(),
        higher,
        lower,
        same
    );

    if !report.directors.is_empty() {
        println!("\n{:<30} {:>6} {:>9}", "Director", "Films", "Avg Diff");
        println!("{}", "-".repeat(48));
        for director in &report.directors {
            let name: String = director.name.chars().take(29).collect();
            println!(
                "{:<30} {:>6} {:>+9.2}",
                name, director.film_count, director.avg_diff
            );
        }
    }
}
