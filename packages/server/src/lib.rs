#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web invocation server for riksdata ingestion.
//!
//! Exposes the two source invocations and the file queue worker under
//! `/functions/v1`, plus operator routes under `/api/admin`. Every
//! invocation and admin route requires a bearer token whose user holds the
//! `admin` role.

mod auth;
mod error;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use riksdata_database::postgres::PgStore;
use riksdata_database::store::IngestStore;
use riksdata_database::{db, run_migrations};
use riksdata_ingest::driver::PAGE_DELAY;
use riksdata_source::fetch::{BinaryFetcher, HttpFetcher, PageFetcher};
use riksdata_source::retry::RetryPolicy;
use riksdata_storage::{ObjectStore, S3ObjectStore};
use tokio_util::sync::CancellationToken;

pub use error::ApiError;

/// Shared application state.
pub struct AppState {
    /// Progress ledger, record sink, file queue, audit log, and tokens.
    pub store: Arc<dyn IngestStore>,
    /// Page fetcher for source invocations.
    pub pages: Arc<dyn PageFetcher>,
    /// File fetcher for the queue worker.
    pub files: Arc<dyn BinaryFetcher>,
    /// Attachment object storage.
    pub objects: Arc<dyn ObjectStore>,
    /// Retry policy for page fetches.
    pub retry: RetryPolicy,
    /// Delay between pages.
    pub page_delay: Duration,
    /// Cancelled on shutdown; in-flight runs stop at their next page.
    pub shutdown: CancellationToken,
}

/// Registers every route. Shared by [`run_server`] and handler tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/functions/v1")
            .route(
                "/fetch-riksdagen-data",
                web::post().to(handlers::fetch_riksdagen),
            )
            .route(
                "/fetch-regeringskansliet-data",
                web::post().to(handlers::fetch_regeringskansliet),
            )
            .route(
                "/process-file-queue",
                web::post().to(handlers::process_file_queue),
            ),
    )
    .service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .service(
                web::scope("/admin")
                    .route("/progress", web::get().to(handlers::list_progress))
                    .route(
                        "/progress/{source}/{data_type}",
                        web::delete().to(handlers::delete_progress),
                    )
                    .route(
                        "/progress/{source}/{data_type}/stop",
                        web::post().to(handlers::stop),
                    )
                    .route(
                        "/progress/{source}/{data_type}/clear-stop",
                        web::post().to(handlers::clear_stop),
                    )
                    .route(
                        "/progress/{source}/{data_type}/reset",
                        web::post().to(handlers::reset),
                    )
                    .route("/file-queue/stats", web::get().to(handlers::queue_stats))
                    .route(
                        "/file-queue/reset-failed",
                        web::post().to(handlers::reset_failed),
                    ),
            ),
    );
}

/// Starts the riksdata server.
///
/// Connects to the database, runs migrations, configures object storage
/// from the environment, and serves until shut down. The caller provides
/// the async runtime (e.g. via `#[actix_web::main]`).
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind or
/// encounters a runtime error.
///
/// # Panics
///
/// Panics if the database connection, migrations, HTTP client, or object
/// storage configuration fail.
#[allow(clippy::future_not_send)]
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    log::info!("Connecting to database...");
    let db_conn = db::connect_from_env()
        .await
        .expect("Failed to connect to database");

    log::info!("Running migrations...");
    run_migrations(db_conn.as_ref())
        .await
        .expect("Failed to run migrations");

    let fetcher = Arc::new(HttpFetcher::new().expect("Failed to build HTTP client"));
    let objects = S3ObjectStore::from_env().expect("Failed to configure object storage");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    actix_rt::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested; in-flight runs stop at their next page");
            on_signal.cancel();
        }
    });

    let state = web::Data::new(AppState {
        store: Arc::new(PgStore::new(db_conn)),
        pages: fetcher.clone(),
        files: fetcher,
        objects: Arc::new(objects),
        retry: RetryPolicy::default(),
        page_delay: PAGE_DELAY,
        shutdown,
    });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
