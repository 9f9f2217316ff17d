//! Storage faults.
//!
//! The failure modes of the config store and fallback queue: a key lookup
//! that misses, a document the validator refuses to persist, a row that no
//! longer encodes or decodes, and trouble in the embedded database or the
//! filesystem underneath it.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// No document under the requested key.
    #[error("no entry for {0}")]
    Missing(String),

    /// The document failed validation and was not persisted.
    #[error("document rejected: {0}")]
    Rejected(String),

    /// A row failed to encode or decode. On the read side this usually
    /// means schema drift between firmware versions.
    #[error("row codec: {0}")]
    Codec(String),

    /// The embedded database refused the operation.
    #[error("database {stage}: {detail}")]
    Database {
        /// Which stage failed: open, transaction, table, row access, commit.
        stage: &'static str,
        detail: String,
    },

    /// Filesystem trouble around the database file.
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    fn database(stage: &'static str, detail: impl std::fmt::Display) -> Self {
        Error::Database {
            stage,
            detail: detail.to_string(),
        }
    }
}

impl From<fieldgate_core::CoreError> for Error {
    fn from(e: fieldgate_core::CoreError) -> Self {
        match e {
            fieldgate_core::CoreError::NotFound(what) => Error::Missing(what),
            other => Error::Rejected(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

// Each redb error type maps onto the database stage it belongs to.
macro_rules! database_stage {
    ($($ty:ty => $stage:literal),+ $(,)?) => {$(
        impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Error::database($stage, e)
            }
        }
    )+};
}

database_stage! {
    redb::DatabaseError => "open",
    redb::TransactionError => "transaction",
    redb::TableError => "table",
    redb::StorageError => "row access",
    redb::CommitError => "commit",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let missing: Error = fieldgate_core::CoreError::NotFound("device 'FFFFFF'".into()).into();
        assert!(matches!(missing, Error::Missing(_)));

        let rejected: Error =
            fieldgate_core::CoreError::ConfigInvalid("slave_id 0 outside 1..247".into()).into();
        assert!(matches!(rejected, Error::Rejected(_)));
    }

    #[test]
    fn test_database_stage_in_message() {
        let error = Error::database("commit", "disk full");
        assert_eq!(error.to_string(), "database commit: disk full");
    }
}
