#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Persistence for ingestion: the upsert sink, the progress and control
//! ledger, the file download queue, the audit log, and the access
//! directory.
//!
//! Every concern is a trait in [`store`]. [`postgres::PgStore`] implements
//! them with raw SQL through `switchy_database`; [`memory::MemoryStore`]
//! implements them in process for tests and dry runs. Schema changes are
//! embedded SQL migrations applied with `switchy_schema`.

pub mod db;
pub mod memory;
pub mod postgres;
pub mod store;

use include_dir::{Dir, include_dir};
use sha2::{Digest as _, Sha256};
use switchy_database::Database;
use switchy_schema::discovery::embedded::EmbeddedMigrationSource;
use switchy_schema::runner::MigrationRunner;

/// Embedded SQL migrations from the `migrations/` directory.
static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/../../migrations");

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] switchy_schema::MigrationError),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// A table or column name failed validation and was not sent to the
    /// database.
    #[error("Invalid identifier: {name}")]
    InvalidIdentifier {
        /// The rejected name.
        name: String,
    },

    /// A write violated a table constraint.
    #[error("Constraint violation on {table}: {message}")]
    Constraint {
        /// Table written to.
        table: String,
        /// Description of the violation.
        message: String,
    },
}

/// Runs all pending database migrations.
///
/// # Errors
///
/// Returns [`DbError`] if any migration fails to apply.
pub async fn run_migrations(db: &dyn Database) -> Result<(), DbError> {
    let source = EmbeddedMigrationSource::new(&MIGRATIONS_DIR);
    let runner = MigrationRunner::new(Box::new(source));
    runner.run(db).await?;
    log::info!("Database migrations completed successfully");
    Ok(())
}

/// Hashes a bearer token for storage and lookup. Raw tokens are never
/// persisted.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Returns `true` for a plain lowercase SQL identifier
/// (`[a-z_][a-z0-9_]*`).
#[must_use]
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Validates a destination table against the source registry and a column
/// list against [`is_plain_identifier`].
///
/// # Errors
///
/// Returns [`DbError::InvalidIdentifier`] naming the first rejected name.
pub fn validate_identifiers<'a>(
    table: &str,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<(), DbError> {
    if !riksdata_source::registry::is_known_table(table) || !is_plain_identifier(table) {
        return Err(DbError::InvalidIdentifier {
            name: table.to_string(),
        });
    }
    for column in columns {
        if !is_plain_identifier(column) {
            return Err(DbError::InvalidIdentifier {
                name: column.to_string(),
            });
        }
    }
    Ok(())
}
