//! Shared helpers for the Postgres-backed stores and reader.
//!
//! Table, view, and order-by fragments come from configuration and are
//! interpolated into SQL text (identifiers cannot be bound as
//! parameters), so they are validated against a strict character
//! allowlist first.

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::{Error, Result};

/// Default connection pool size for state stores and the view reader.
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Validates a table, view, or column identifier from configuration.
///
/// Accepts dotted schema-qualified names made of ASCII alphanumerics
/// and underscores.
///
/// # Errors
///
/// Returns a configuration error for empty input or any other character.
pub fn validate_identifier(ident: &str) -> Result<&str> {
    let ok = !ident.is_empty()
        && ident.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if ok {
        Ok(ident)
    } else {
        Err(Error::configuration(format!(
            "invalid SQL identifier: '{ident}'"
        )))
    }
}

/// Validates an ORDER BY fragment from configuration.
///
/// Accepts comma-separated column references with optional `ASC`/`DESC`
/// keywords; anything outside `[A-Za-z0-9_., ]` is rejected.
///
/// # Errors
///
/// Returns a configuration error for empty input or any other character.
pub fn validate_order_by(order_by: &str) -> Result<&str> {
    let ok = !order_by.trim().is_empty()
        && order_by
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ',' | ' '));

    if ok {
        Ok(order_by)
    } else {
        Err(Error::configuration(format!(
            "invalid ORDER BY fragment: '{order_by}'"
        )))
    }
}

/// Connects a lazily-initialized pool for the given connection string.
///
/// The first statement, not this call, establishes the connection, so
/// the host can start before its databases are reachable and the
/// readiness probe reports the truth.
///
/// # Errors
///
/// Returns a configuration error if the connection string is malformed.
pub fn connect_lazy(connection_string: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .connect_lazy(connection_string)
        .map_err(|e| Error::configuration(format!("invalid connection string: {e}")))
}

/// Maps a sqlx error to a store error, preserving the cause.
pub fn store_err(context: &str, source: sqlx::Error) -> Error {
    Error::store_with_source(context.to_string(), source)
}
