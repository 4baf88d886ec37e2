//! Error types for metadata database operations

/// Errors that can occur when interacting with the metadata database
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error connecting to metadata db: {0}")]
    ConnectionError(#[source] sqlx::Error),

    #[error("Error running migrations: {0}")]
    MigrationError(#[source] sqlx::migrate::MigrateError),

    #[error("Error executing database query: {0}")]
    DbError(#[source] sqlx::Error),

    /// A stored segment or schema payload could not be decoded.
    ///
    /// Payloads are written by this crate only, so this indicates a database written by an
    /// incompatible version or edited by hand.
    #[error("Error decoding stored payload: {0}")]
    PayloadError(#[source] serde_json::Error),
}

impl Error {
    /// Returns `true` if the error is likely to be a transient connection issue.
    ///
    /// The following errors are considered retryable:
    /// - `Error::ConnectionError`: the initial connection to the database failed.
    /// - `sqlx::Error::Io`: an I/O error on an established connection.
    /// - `sqlx::Error::PoolTimedOut`: no connection became free in time.
    /// - `sqlx::Error::PoolClosed`: the pool was closed while an operation was pending.
    ///
    /// Constraint violations and decoding errors are never transient.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::ConnectionError(_) => true,
            Error::DbError(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}
