//! Shared Postgres plumbing for the durable stores.

use crate::error::OrchestrationError;
use crate::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt::Display;
use tracing::info;

/// Lazily-connecting pool; the first query opens the connection.
pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(database_url)
        .map_err(|e| db_error("Failed to configure postgres pool", e))?;
    info!("Postgres pool configured");
    Ok(pool)
}

pub(crate) fn db_error(context: &str, error: impl Display) -> OrchestrationError {
    OrchestrationError::Database(format!("{}: {}", context, error))
}
