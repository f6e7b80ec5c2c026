#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the riksdata ingestion tool.

use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use riksdata_cli_utils::{IndicatifProgress, init_logger};
use riksdata_database::memory::MemoryStore;
use riksdata_database::postgres::PgStore;
use riksdata_database::store::{AccessDirectory as _, IngestStore};
use riksdata_database::{db, run_migrations};
use riksdata_database_models::Role;
use riksdata_ingest::driver::FetchDriver;
use riksdata_ingest::worker::{DEFAULT_BATCH_SIZE, FileWorker};
use riksdata_ingest::{IngestError, admin};
use riksdata_ingest_models::{IngestRequest, RunOutcome};
use riksdata_source::fetch::HttpFetcher;
use riksdata_source::registry::all_sources;
use riksdata_source_models::{DataSource, FetchFilters};
use riksdata_storage::{MemoryObjectStore, ObjectStore, S3ObjectStore};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "riksdata_ingest",
    about = "Swedish government open data ingestion tool"
)]
struct Cli {
    /// Use an in-memory store and object storage instead of `DATABASE_URL`
    /// and the S3 endpoint. Remote sources are still fetched.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StreamArgs {
    /// Source identifier (`riksdagen` or `regeringskansliet`)
    source: DataSource,
    /// Data type (e.g., "dokument", "ud-avrader")
    data_type: String,
}

#[derive(Args)]
struct FilterArgs {
    /// Earliest date, as accepted by the remote API
    #[arg(long)]
    date_from: Option<String>,
    /// Latest date, as accepted by the remote API
    #[arg(long)]
    date_to: Option<String>,
    /// Parliamentary session (e.g., "2023/24")
    #[arg(long)]
    period: Option<String>,
    /// Document category or type
    #[arg(long)]
    category: Option<String>,
    /// Owning organisation
    #[arg(long)]
    org: Option<String>,
    /// Records per page
    #[arg(long)]
    page_size: Option<u32>,
    /// Free-text search
    #[arg(long)]
    text: Option<String>,
}

impl From<FilterArgs> for FetchFilters {
    fn from(args: FilterArgs) -> Self {
        Self {
            date_from: args.date_from,
            date_to: args.date_to,
            period: args.period,
            category: args.category,
            org: args.org,
            page_size: args.page_size,
            text: args.text,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch up to one page budget of a data type, resuming from the stored
    /// cursor when a previous run was partial
    Fetch {
        #[command(flatten)]
        stream: StreamArgs,
        /// Maximum pages for this invocation (capped by the page budget)
        #[arg(long)]
        max_pages: Option<u32>,
        /// Fetch only the first page
        #[arg(long)]
        no_paginate: bool,
        /// Keep invoking until the data type is complete or stopped
        #[arg(long)]
        until_complete: bool,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Download queued attachments into object storage
    ProcessFiles {
        /// Tasks to claim
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: u32,
    },
    /// Ask a running fetch to stop at its next page boundary
    Stop(StreamArgs),
    /// Clear a stop request so the next fetch resumes
    ClearStop(StreamArgs),
    /// Reset progress so the next fetch starts from the first page
    Reset(StreamArgs),
    /// Delete progress and control rows
    Delete(StreamArgs),
    /// Show fetch progress
    Status {
        /// Only show this source
        #[arg(long)]
        source: Option<DataSource>,
    },
    /// Show file queue counts
    QueueStats,
    /// Return failed file downloads to pending
    ResetFailed,
    /// List configured sources and data types
    Sources,
    /// Run database migrations
    Migrate,
    /// Issue a bearer token for the HTTP server
    IssueToken {
        /// User the token belongs to
        user_id: String,
        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },
}

async fn open_store(dry_run: bool) -> Result<Box<dyn IngestStore>, Box<dyn std::error::Error>> {
    if dry_run {
        log::info!("Dry run: using an in-memory store");
        return Ok(Box::new(MemoryStore::new()));
    }
    let db = db::connect_from_env().await?;
    run_migrations(db.as_ref()).await?;
    Ok(Box::new(PgStore::new(db)))
}

fn open_objects(dry_run: bool) -> Result<Box<dyn ObjectStore>, Box<dyn std::error::Error>> {
    if dry_run {
        return Ok(Box::new(MemoryObjectStore::new()));
    }
    Ok(Box::new(S3ObjectStore::from_env()?))
}

/// Cancels the returned token on Ctrl-C. Runs stop at the next page
/// boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; stopping at the next page boundary...");
            cancel.cancel();
        }
    });
    token
}

fn print_sources() {
    println!("{:<20} {:<30} TABLE", "SOURCE", "DATA TYPE");
    println!("{}", "-".repeat(80));
    for source in all_sources() {
        for endpoint in &source.endpoints {
            println!(
                "{:<20} {:<30} {}",
                source.id, endpoint.data_type, endpoint.table
            );
        }
    }
}

async fn print_status(
    store: &dyn IngestStore,
    source: Option<DataSource>,
) -> Result<(), IngestError> {
    let rows = admin::list_progress(store, source).await?;
    if rows.is_empty() {
        println!("No progress recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:<28} {:<12} {:>8} {:>10} LAST FETCHED",
        "SOURCE", "DATA TYPE", "STATUS", "PAGE", "ITEMS"
    );
    println!("{}", "-".repeat(100));
    for row in rows {
        let page = row
            .total_pages
            .map_or_else(|| row.current_page.to_string(), |total| {
                format!("{}/{total}", row.current_page)
            });
        println!(
            "{:<20} {:<28} {:<12} {:>8} {:>10} {}",
            row.source,
            row.data_type,
            row.status,
            page,
            row.items_fetched,
            row.last_fetched_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
        );
        if let Some(error) = row.error_message {
            println!("    error: {error}");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            log::info!("Running database migrations...");
            let db = db::connect_from_env().await?;
            run_migrations(db.as_ref()).await?;
            log::info!("Migrations complete.");
        }
        Commands::Sources => print_sources(),
        Commands::Fetch {
            stream,
            max_pages,
            no_paginate,
            until_complete,
            filters,
        } => {
            let store = open_store(cli.dry_run).await?;
            let fetcher = HttpFetcher::new()?;
            let cancel = cancel_on_ctrl_c();

            let mut request = IngestRequest::new(stream.data_type)
                .paginate(!no_paginate)
                .filters(filters.into());
            request.max_pages = max_pages;

            let start = Instant::now();
            loop {
                let progress = IndicatifProgress::pages_bar(&multi, &request.data_type);
                let summary = FetchDriver::new(store.as_ref(), &fetcher)
                    .cancellation(cancel.clone())
                    .progress(progress)
                    .run(stream.source, &request)
                    .await?;

                println!("{}", summary.message());
                if summary.errors > 0 {
                    println!("  {} items could not be stored (see log)", summary.errors);
                }
                if summary.files_queued > 0 {
                    println!("  {} attachments queued", summary.files_queued);
                }

                if !until_complete
                    || summary.outcome != RunOutcome::Partial
                    || cancel.is_cancelled()
                {
                    break;
                }
            }
            log::info!("Done in {:.1}s", start.elapsed().as_secs_f64());
        }
        Commands::ProcessFiles { batch_size } => {
            let store = open_store(cli.dry_run).await?;
            let objects = open_objects(cli.dry_run)?;
            let fetcher = HttpFetcher::new()?;

            let progress = IndicatifProgress::files_bar(&multi, "Downloading attachments");
            let summary = FileWorker::new(store.as_ref(), &fetcher, objects.as_ref())
                .batch_size(batch_size)
                .progress(progress)
                .run()
                .await?;

            println!(
                "Processed {} files, {} failed, {} requeued",
                summary.processed, summary.failed, summary.requeued
            );
        }
        Commands::Stop(stream) => {
            let store = open_store(cli.dry_run).await?;
            let key = admin::request_stop(store.as_ref(), stream.source, &stream.data_type).await?;
            println!("Stop requested for {key}");
        }
        Commands::ClearStop(stream) => {
            let store = open_store(cli.dry_run).await?;
            let key = admin::clear_stop(store.as_ref(), stream.source, &stream.data_type).await?;
            println!("Stop flag cleared for {key}");
        }
        Commands::Reset(stream) => {
            let store = open_store(cli.dry_run).await?;
            let key = admin::reset(store.as_ref(), stream.source, &stream.data_type).await?;
            println!("Progress reset for {key}");
        }
        Commands::Delete(stream) => {
            let store = open_store(cli.dry_run).await?;
            if admin::delete(store.as_ref(), stream.source, &stream.data_type).await? {
                println!("Progress deleted for {}/{}", stream.source, stream.data_type);
            } else {
                println!("No progress for {}/{}", stream.source, stream.data_type);
            }
        }
        Commands::Status { source } => {
            let store = open_store(cli.dry_run).await?;
            print_status(store.as_ref(), source).await?;
        }
        Commands::QueueStats => {
            let store = open_store(cli.dry_run).await?;
            let stats = admin::queue_stats(store.as_ref()).await?;
            println!("pending:    {}", stats.pending);
            println!("processing: {}", stats.processing);
            println!("completed:  {}", stats.completed);
            println!("failed:     {}", stats.failed);
        }
        Commands::ResetFailed => {
            let store = open_store(cli.dry_run).await?;
            let count = admin::reset_failed(store.as_ref()).await?;
            println!("Reset {count} failed downloads to pending");
        }
        Commands::IssueToken { user_id, admin } => {
            let store = open_store(cli.dry_run).await?;
            let token = uuid::Uuid::new_v4().simple().to_string();
            let roles = if admin {
                vec![Role::Admin]
            } else {
                vec![Role::User]
            };
            store.register_token(&token, &user_id, &roles).await?;
            println!("{token}");
            log::info!("Issued token for {user_id} with roles {roles:?}");
        }
    }

    Ok(())
}
