use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to load environment variables for database connection: {0}")]
    ConnectionConfigError(String),

    #[error("Database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("A stored row could not be decoded: {0}")]
    Decode(#[from] core_types::CoreError),

    /// A version check or status precondition failed inside a commit.
    /// Nothing from that commit was written.
    #[error("Concurrent write conflict: {0}")]
    Conflict(String),

    #[error("The requested data was not found in the database.")]
    NotFound,
}

impl DbError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }
}
