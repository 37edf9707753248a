use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use nse_listing_engine::config::AppConfig;
use nse_listing_engine::loader::dedup::dedup;
use nse_listing_engine::loader::{discover_csv_files, load_csv};
use nse_listing_engine::models::{Category, CycleMetadata, SearchOptions};
use nse_listing_engine::pipeline::FetchOptions;
use nse_listing_engine::service::StockService;
use nse_listing_engine::storage::Repository;
use nse_listing_engine::utils;

#[derive(Parser)]
#[command(name = "nse-listing-engine", about = "NSE securities listing ingestion", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fetch cycle: discover endpoints, download, normalize, store
    Fetch {
        /// Ignore the record set, CSV cache and discovery TTL
        #[arg(short, long)]
        force: bool,

        /// Also ingest SME, ETF, REIT and InvIT listings
        #[arg(short, long)]
        include_optional: bool,
    },

    /// Forced fetch of every endpoint
    Refresh,

    /// Search stored records by symbol or company name
    Search {
        query: String,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Exact symbol match only
        #[arg(short, long)]
        exact: bool,
    },

    /// Look up one symbol
    Get { symbol: String },

    /// List records of one category (equity, sme, etf, reits, invits)
    List { category: String },

    /// Crawl, classify and resolve endpoint URLs without downloading
    Discover {
        #[arg(short, long)]
        force: bool,
    },

    /// Show cached CSV payloads and the resolved endpoint table
    CacheStatus,

    /// Show health and metrics after a fetch cycle
    Health,

    /// Import listing CSVs from a local directory (EQUITY_L.csv, SME_EQUITY_L.csv, ...)
    LoadCsv {
        #[arg(short, long, default_value = "data")]
        dir: PathBuf,
    },

    /// Show database statistics
    Stats,

    /// List all stored symbols
    Symbols,

    /// Apply schema migrations without loading data
    Migrate,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "nse_listing_engine=info,warn",
        1 => "nse_listing_engine=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Fetch {
            force,
            include_optional,
        } => {
            let _t = utils::Timer::start("Fetch");
            let svc = StockService::from_config(&config)?;
            let mut resp = svc
                .fetch_all(FetchOptions {
                    force_refresh: force,
                    include_optional,
                })
                .await;
            resp.records.clear();
            print_json(&resp)?;
        }

        Command::Refresh => {
            let _t = utils::Timer::start("Forced refresh");
            let svc = StockService::from_config(&config)?;
            let mut resp = svc.force_refresh().await;
            resp.records.clear();
            print_json(&resp)?;
            print_json(&svc.get_health_status().await)?;
        }

        Command::Search {
            query,
            limit,
            exact,
        } => {
            let svc = StockService::from_config(&config)?;
            let hits = svc.search(
                &query,
                &SearchOptions {
                    limit,
                    exact_match: exact,
                },
            );
            if hits.is_empty() {
                println!("No matches for {:?}.", query);
            }
            for r in &hits {
                println!(
                    "  {:<14} {:<6} {:<8} {}",
                    r.symbol,
                    r.series.as_deref().unwrap_or("—"),
                    r.category,
                    r.name
                );
            }
        }

        Command::Get { symbol } => {
            let svc = StockService::from_config(&config)?;
            match svc.get_by_symbol(&symbol) {
                Some(r) => print_json(&r)?,
                None => println!("{} not found — run `nse-listing-engine fetch` first.", symbol.to_uppercase()),
            }
        }

        Command::List { category } => {
            let Some(category) = Category::parse(&category) else {
                anyhow::bail!("Unknown category {:?}", category);
            };
            let svc = StockService::from_config(&config)?;
            let records = svc.get_by_category(category);
            println!("{} {} records:", records.len(), category);
            for r in &records {
                println!("  {:<14} {}", r.symbol, r.name);
            }
        }

        Command::Discover { force } => {
            let _t = utils::Timer::start("Discovery");
            let svc = StockService::from_config(&config)?;
            print_json(&svc.discover(force).await)?;
        }

        Command::CacheStatus => {
            let svc = StockService::from_config(&config)?;
            let status = svc.get_cache_status().await;
            println!("─────────────────────────────────────────────────────────");
            for c in &status.csv {
                println!(
                    "  {:<16} {:>10} {:>8} lines  age {:>6}s  {}",
                    c.key,
                    utils::fmt_bytes(c.size_bytes),
                    utils::fmt_number(c.line_count as i64),
                    c.age_secs,
                    if c.valid { "valid" } else { "stale" }
                );
            }
            println!("─────────────────────────────────────────────────────────");
            print_json(&status.endpoints)?;
        }

        Command::Health => {
            let svc = StockService::from_config(&config)?;
            print_json(&svc.get_health_status().await)?;
        }

        Command::LoadCsv { dir } => {
            let _t = utils::Timer::start("CSV import");
            let repo = Repository::open(&config.storage.db_path)?;
            repo.run_migrations()?;

            let files = discover_csv_files(&dir)?;
            info!("Found {} CSV files in {:?}", files.len(), dir);

            let started_at = Utc::now();
            let mut all = Vec::new();
            let mut breakdown = BTreeMap::new();
            let mut errors = 0usize;

            for path in &files {
                match load_csv(path) {
                    Ok((category, records)) => {
                        *breakdown.entry(category).or_insert(0) += records.len();
                        all.extend(records);
                    }
                    Err(e) => {
                        warn!("Error loading {:?}: {:#}", path, e);
                        errors += 1;
                    }
                }
            }

            let records = dedup(all);
            let n = repo.upsert_stocks(&records)?;
            repo.log_cycle(&CycleMetadata {
                started_at,
                finished_at: Utc::now(),
                success: errors == 0,
                source: format!("file:{}", dir.display()),
                record_count: n,
                breakdown,
                error: (errors > 0).then(|| format!("{} files failed", errors)),
            })?;

            info!("Done: {} records stored, {} errors", n, errors);
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            let stats = repo.stats()?;
            println!("─────────────────────────────────");
            println!("  NSE listings — Database Stats");
            println!("─────────────────────────────────");
            println!("  Stocks     : {}", utils::fmt_number(stats.stocks));
            for (category, n) in &stats.by_category {
                println!("    {:<9}: {}", category, utils::fmt_number(*n));
            }
            println!("  Cycles     : {}", utils::fmt_number(stats.cycles));
            println!(
                "  Last cycle : {}",
                stats.last_cycle.map(|d| d.to_string()).unwrap_or("—".into())
            );
            println!("─────────────────────────────────");
        }

        Command::Symbols => {
            let repo = Repository::open(&config.storage.db_path)?;
            let syms = repo.list_symbols()?;
            if syms.is_empty() {
                println!("No symbols — run `nse-listing-engine fetch` or `load-csv` first.");
            } else {
                println!("{} symbols:", syms.len());
                for s in &syms {
                    println!("  {}", s);
                }
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
