use std::fmt;
use std::path::Path;

use bijux_drift_model::{ArtifactKind, ModelError};

/// Whole-artifact failures. Per-endpoint failures are recorded in the
/// fragment instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    Io { path: String, message: String },
    Parse { artifact: ArtifactKind, message: String },
    Pattern(String),
    Model(ModelError),
}

impl ExtractError {
    pub(crate) fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn parse(artifact: ArtifactKind, message: impl Into<String>) -> Self {
        Self::Parse {
            artifact,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, message } => write!(f, "failed to read {path}: {message}"),
            Self::Parse { artifact, message } => {
                write!(f, "{} artifact could not be parsed: {message}", artifact.as_str())
            }
            Self::Pattern(message) => write!(f, "extractor pattern failed to compile: {message}"),
            Self::Model(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ExtractError {}

impl From<ModelError> for ExtractError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

impl From<regex::Error> for ExtractError {
    fn from(value: regex::Error) -> Self {
        Self::Pattern(value.to_string())
    }
}
