use std::fmt::{Display, Formatter};

use bijux_drift_extract::ExtractError;
use bijux_drift_model::ModelError;
use bijux_drift_store::StoreError;

/// Failure reported by an outbound collaborator (ticketing, webhook, verifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortError(pub String);

impl Display for PortError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PortError {}

#[derive(Debug)]
pub enum OrchestratorError {
    Config(String),
    Extract(ExtractError),
    Model(ModelError),
    Store(StoreError),
    Port(PortError),
    Io(String),
    Task(String),
}

impl Display for OrchestratorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Extract(err) => write!(f, "extraction failed: {err}"),
            Self::Model(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "issue store: {err}"),
            Self::Port(err) => write!(f, "collaborator failed: {err}"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
            Self::Task(msg) => write!(f, "task failed: {msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<ExtractError> for OrchestratorError {
    fn from(value: ExtractError) -> Self {
        Self::Extract(value)
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<PortError> for OrchestratorError {
    fn from(value: PortError) -> Self {
        Self::Port(value)
    }
}

impl From<tokio::task::JoinError> for OrchestratorError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Task(value.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(value: serde_json::Error) -> Self {
        Self::Io(format!("json encode failed: {value}"))
    }
}
