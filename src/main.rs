//! # Awesome Index CLI (`awix`)
//!
//! The `awix` binary is the primary interface for Awesome Index. It provides
//! commands for database initialization, indexing runs, run inspection,
//! search, and starting the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! awix --config ./config/awix.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `awix init` | Create the SQLite database and run schema migrations |
//! | `awix index` | Run a full indexing pass (fetch + normalize) |
//! | `awix status` | Show the latest indexing run |
//! | `awix history` | List past indexing runs |
//! | `awix search "<query>"` | Search indexed entries |
//! | `awix serve` | Start the JSON HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! awix init --config ./config/awix.toml
//!
//! # Run a scheduled indexing pass (cron-friendly)
//! awix index --trigger scheduled
//!
//! # Search the go registry for high-star web frameworks
//! awix search "gin" --registry go --min-stars 10000
//!
//! # Start the HTTP API
//! awix serve --config ./config/awix.toml
//! ```

mod cache;
mod config;
mod db;
mod error;
mod fetch;
mod index;
mod migrate;
mod models;
mod normalize;
mod orchestrate;
mod search;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::models::{RunStatus, TriggerSource};

/// Awesome Index CLI — an indexing and search service for curated
/// "awesome list" registries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/awix.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "awix",
    about = "Awesome Index — an indexing and search service for curated awesome-list registries",
    version,
    long_about = "Awesome Index discovers registry sub-repositories from a meta-repository archive, \
    fetches each registry's generated data file, normalizes the entries into a relational SQLite \
    store, and serves ranked faceted search via a CLI and JSON HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/awix.toml`. All database, fetcher, search, and
    /// server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/awix.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (repositories, registries, registry_items, repo_facets, index_runs).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Run a full indexing pass.
    ///
    /// Discovers all registries, fetches their data files, and normalizes
    /// them into the store. One registry's failure never aborts the run.
    /// Exits non-zero if another run is already active or discovery fails,
    /// so cron and CI wrappers observe the outcome.
    Index {
        /// How the run is attributed in history: `manual` or `scheduled`.
        #[arg(long, default_value = "manual")]
        trigger: String,

        /// Override the configured registries archive URL for this run.
        #[arg(long)]
        archive_url: Option<String>,
    },

    /// Show the latest indexing run.
    Status,

    /// List past indexing runs, most recent first.
    History {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Number of runs to skip.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Search indexed entries.
    ///
    /// Queries the search index (with relational fallback) and prints
    /// ranked results.
    Search {
        /// The search query string. Empty lists top entries by stars.
        #[arg(default_value = "")]
        query: String,

        /// Filter by registry name (e.g. `go`, `python`).
        #[arg(long)]
        registry: Option<String>,

        /// Filter by category label (e.g. `Web Frameworks`).
        #[arg(long)]
        category: Option<String>,

        /// Filter by primary language.
        #[arg(long)]
        language: Option<String>,

        /// Only entries with at least this many stars.
        #[arg(long)]
        min_stars: Option<i64>,

        /// Include archived repositories.
        #[arg(long)]
        archived: bool,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Start the JSON HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// search and admin indexing endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            trigger,
            archive_url,
        } => {
            let trigger = match trigger.as_str() {
                "manual" => TriggerSource::Manual,
                "scheduled" => TriggerSource::Scheduled,
                other => anyhow::bail!("unknown trigger source: {}", other),
            };
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let fetcher = fetch::HttpRegistryFetcher::new(&cfg.fetcher, archive_url)?;
            let run = orchestrate::run_indexing(&pool, &fetcher, None, trigger, None).await?;

            println!(
                "Run {} {}: {}/{} registries processed ({} ok, {} failed)",
                run.id,
                run.status.as_str(),
                run.processed_registries,
                run.total_registries,
                run.success_count,
                run.failed_count
            );
            for err in &run.errors {
                println!("  {}", err);
            }
            if run.status == RunStatus::Failed {
                anyhow::bail!(
                    "indexing run failed: {}",
                    run.error_message.unwrap_or_else(|| "unknown".to_string())
                );
            }
        }
        Commands::Status => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let (status, run) = orchestrate::latest_status(&pool).await?;
            match run {
                Some(run) => {
                    println!("Status: {}", status);
                    println!("Run: {} ({})", run.id, run.trigger_source);
                    println!(
                        "Progress: {}/{} ({} ok, {} failed)",
                        run.processed_registries,
                        run.total_registries,
                        run.success_count,
                        run.failed_count
                    );
                    if let Some(current) = &run.current_registry {
                        println!("Current registry: {}", current);
                    }
                    if let Some(message) = &run.error_message {
                        println!("Error: {}", message);
                    }
                }
                None => println!("Status: {} (no runs yet)", status),
            }
        }
        Commands::History { limit, offset } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let runs = orchestrate::list_runs(&pool, limit, offset).await?;
            if runs.is_empty() {
                println!("No indexing runs recorded.");
            }
            for run in runs {
                println!(
                    "{}  {}  {}  {}/{} ({} ok, {} failed)",
                    run.id,
                    run.status.as_str(),
                    run.trigger_source,
                    run.processed_registries,
                    run.total_registries,
                    run.success_count,
                    run.failed_count
                );
            }
        }
        Commands::Search {
            query,
            registry,
            category,
            language,
            min_stars,
            archived,
            limit,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let request = search::SearchQuery {
                q: Some(query),
                registry,
                category,
                language,
                archived: if archived { None } else { Some(false) },
                min_stars,
                sort_by: None,
                limit: Some(limit),
                offset: None,
            };
            let page = search::search_page(&pool, None, &cfg.search, &request).await?;

            if page.data.is_empty() {
                println!("No results.");
            }
            for item in &page.data {
                let language = item.language.as_deref().unwrap_or("-");
                println!(
                    "{:>8} ★  [{}] {}  ({})",
                    item.stars, item.registry, item.title, language
                );
                if let Some(description) = &item.description {
                    println!("            {}", description);
                }
            }
            println!(
                "{} of {} result(s){}",
                page.data.len(),
                page.total,
                if page.used_fallback {
                    " (store fallback)"
                } else {
                    ""
                }
            );
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            server::run_server(&cfg, pool).await?;
        }
    }

    Ok(())
}
