use std::fmt;

use bijux_drift_model::{IssueId, MismatchId, ModelError};

#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    Sqlite(String),
    Codec(String),
    Io(String),
    NotFound(IssueId),
    NoRecordForMismatch(MismatchId),
    Model(ModelError),
    Poisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(detail) => write!(f, "sqlite error: {detail}"),
            Self::Codec(detail) => write!(f, "record encoding error: {detail}"),
            Self::Io(detail) => write!(f, "io error: {detail}"),
            Self::NotFound(id) => write!(f, "issue record {id} not found"),
            Self::NoRecordForMismatch(id) => write!(f, "no issue record for mismatch {id}"),
            Self::Model(err) => write!(f, "{err}"),
            Self::Poisoned => write!(f, "issue store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

impl From<ModelError> for StoreError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}
