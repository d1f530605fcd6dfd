use database::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Ledger commit still conflicting after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl ExecutorError {
    /// The HTTP status a transport layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ExecutorError::NotFound(_) => 404,
            ExecutorError::InvalidRequest(_) => 400,
            ExecutorError::Conflict { .. } => 409,
            ExecutorError::Store(DbError::Conflict(_)) => 409,
            ExecutorError::Store(DbError::NotFound) => 404,
            ExecutorError::Store(_) => 500,
        }
    }
}
