//! Error classification and bounded retry for SQL operations.

use std::error::Error as _;
use std::future::Future;

use deadpool_postgres::PoolError;
use tokio_postgres::error::SqlState;
use vellum_core::{IndexError, RetryConfig, StorageError, ValidationError};

/// Error type for a single SQL attempt.
#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// SQL states worth retrying: the server dropped us, or the transaction lost a race.
const TRANSIENT_STATES: &[SqlState] = &[
    SqlState::T_R_SERIALIZATION_FAILURE,
    SqlState::T_R_DEADLOCK_DETECTED,
    SqlState::CONNECTION_EXCEPTION,
    SqlState::CONNECTION_FAILURE,
    SqlState::CONNECTION_DOES_NOT_EXIST,
    SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION,
    SqlState::ADMIN_SHUTDOWN,
    SqlState::CRASH_SHUTDOWN,
    SqlState::CANNOT_CONNECT_NOW,
    SqlState::TOO_MANY_CONNECTIONS,
];

fn is_transient_postgres(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    match e.code() {
        Some(code) => TRANSIENT_STATES.contains(code),
        None => e
            .source()
            .is_some_and(|source| source.is::<std::io::Error>()),
    }
}

impl SqlError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SqlError::Postgres(e) => is_transient_postgres(e),
            SqlError::Pool(PoolError::Timeout(_)) => true,
            SqlError::Pool(PoolError::Backend(e)) => is_transient_postgres(e),
            SqlError::Pool(_) => false,
            SqlError::Index(_) => false,
        }
    }

    pub fn into_index_error(self, operation: &str) -> IndexError {
        match self {
            SqlError::Index(e) => e,
            SqlError::Postgres(e) => match e.as_db_error() {
                Some(db) if *db.code() == SqlState::UNIQUE_VIOLATION => {
                    ValidationError::ConstraintViolation {
                        constraint: db.constraint().unwrap_or("unique").to_string(),
                        reason: db.message().to_string(),
                    }
                    .into()
                }
                _ => database_error(operation, &e),
            },
            SqlError::Pool(e) => database_error(operation, &e),
        }
    }
}

fn database_error(operation: &str, e: &dyn std::fmt::Display) -> IndexError {
    StorageError::Database {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
    .into()
}

/// Run `attempt` until it succeeds, fails permanently, or has failed
/// transiently more than `retry.max_retries` times.
pub(crate) async fn retry_transient<T, F, Fut>(
    retry: &RetryConfig,
    operation: &str,
    mut attempt: F,
) -> Result<T, IndexError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SqlError>>,
{
    let mut failures = 0u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                failures += 1;
                if failures > retry.max_retries {
                    tracing::error!(
                        operation,
                        attempts = failures,
                        error = %e,
                        "Database operation failed after retries"
                    );
                    return Err(StorageError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: failures,
                        reason: e.to_string(),
                    }
                    .into());
                }
                tracing::warn!(
                    operation,
                    attempt = failures,
                    max_retries = retry.max_retries,
                    error = %e,
                    "Transient database failure, retrying"
                );
                tokio::time::sleep(retry.retry_delay).await;
            }
            Err(e) => return Err(e.into_index_error(operation)),
        }
    }
}
