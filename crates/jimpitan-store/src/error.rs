//! Error types for the jimpitan store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The database could not be opened or upgraded. Every operation fails
    /// with this until a later call manages to open it.
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Record not found: {id}")]
    NotFound { id: i64 },

    #[error("Write error: {0}")]
    Write(String),

    /// Handled by a fallback inside the gateway, never returned from a query.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// A grouped operation failed part way. `committed` earlier writes stay visible.
    #[error("Transaction error: {message}")]
    Transaction {
        index: Option<usize>,
        committed: usize,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Position of the failing item for a batch failure
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            StoreError::Transaction { index, .. } => *index,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_missing_index(&e) {
            return StoreError::IndexUnavailable(e.to_string());
        }
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(e: serde_yaml::Error) -> Self {
        StoreError::Config(e.to_string())
    }
}

/// `INDEXED BY` on an index that is gone fails at prepare time with "no such index"
pub(crate) fn is_missing_index(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.message().contains("no such index"),
        _ => false,
    }
}

/// SQLITE_BUSY and its extended codes
pub(crate) fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("261") | Some("517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        assert_eq!(StoreError::NotFound { id: 42 }.to_string(), "Record not found: 42");

        let err = StoreError::Transaction {
            index: Some(1),
            committed: 1,
            message: "Failed to save item at index 1".to_string(),
        };
        assert_eq!(err.to_string(), "Transaction error: Failed to save item at index 1");
        assert_eq!(err.failed_index(), Some(1));
        assert_eq!(StoreError::Write("x".into()).failed_index(), None);
    }

    #[test]
    fn test_non_database_errors_are_not_index_failures() {
        assert!(!is_missing_index(&sqlx::Error::RowNotFound));
        assert!(!is_busy(&sqlx::Error::PoolTimedOut));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }
}
