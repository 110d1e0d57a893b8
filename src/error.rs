//! Error taxonomy shared by the store interface and every component on top of it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A container or index exists with a definition incompatible with the requested one.
    #[error("schema conflict on {container}.{index}: {detail}")]
    SchemaConflict {
        container: String,
        index: String,
        detail: String,
    },

    #[error("principal {name} already exists in scope {scope}")]
    PrincipalExists { scope: String, name: String },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store could not be acquired within the configured timeout. Safe to retry.
    #[error("store call timed out")]
    Timeout,

    /// The store's own catalog does not match any known version.
    #[error("incompatible store catalog: {0}")]
    IncompatibleCatalog(String),

    #[error("malformed document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("secret hashing failed: {0}")]
    Hashing(String),

    #[error("store backend error: {0}")]
    Backend(rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Only timeouts are transient; everything else needs operator or caller action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Timeout
            }
            _ => StoreError::Backend(err),
        }
    }
}
