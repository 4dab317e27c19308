use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::storage::{WriteError, WriteErrorStatus};

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    /// 409: the stated previous revision does not match the stored one.
    /// Carries the current in-database state for caller-driven retry.
    #[error("write conflict on document '{document_id}'")]
    Conflict {
        document_id: String,
        document_in_db: Option<Box<Value>>,
    },

    /// 422
    #[error("validation failed for document '{document_id}': {message}")]
    Validation { document_id: String, message: String },

    /// 510
    #[error("attachment missing on document '{document_id}'")]
    AttachmentMissing { document_id: String },

    #[error("invalid revision: '{0}'")]
    InvalidRevision(String),

    #[error("document has no primary key at '{path}'")]
    MissingPrimaryKey { path: String },

    #[error("primary key changed from '{previous}' to '{current}'")]
    PrimaryKeyChanged { previous: String, current: String },

    #[error("revision height of '{document_id}' must increase ({previous} -> {current})")]
    RevisionNotIncreasing {
        document_id: String,
        previous: u64,
        current: u64,
    },

    #[error("pre-write hook failed for '{document_id}': {message}")]
    PreWrite { document_id: String, message: String },

    #[error("modifier failed: {0}")]
    Modifier(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("{0} is closed")]
    Closed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("json error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

impl Error {
    /// Map a per-row storage failure into its typed error.
    pub fn from_write_error(err: &WriteError) -> Self {
        match err.status {
            WriteErrorStatus::Conflict => Error::Conflict {
                document_id: err.document_id.clone(),
                document_in_db: err.document_in_db.clone().map(Box::new),
            },
            WriteErrorStatus::Validation => Error::Validation {
                document_id: err.document_id.clone(),
                message: err
                    .message
                    .clone()
                    .unwrap_or_else(|| "schema validation failed".to_string()),
            },
            WriteErrorStatus::AttachmentMissing => Error::AttachmentMissing {
                document_id: err.document_id.clone(),
            },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
