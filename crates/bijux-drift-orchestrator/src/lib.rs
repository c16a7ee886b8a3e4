// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod approval;
pub mod config;
pub mod engine;
mod error;
pub mod ports;
pub mod reporter;

use std::time::{SystemTime, UNIX_EPOCH};

pub use approval::{
    approval_router, send_approval, serve_approvals, ApprovalAck, ApprovalBroker, ApprovalError,
    ApprovalSignal, PendingRun,
};
pub use config::{
    apply_env_overrides, load_config, load_config_file, validate_config_contract,
    OrchestratorConfig, StageTimeouts, VerifyCommand,
};
pub use engine::{cancellation, Orchestrator, RunInputs, RunOutcome};
pub use error::{OrchestratorError, PortError};
pub use ports::{
    CommandVerifier, DryRunTicketing, HttpTicketing, IssueLedger, LogNotifier, NoopVerifier,
    Notifier, Ticketing, VerificationRunner, WebhookNotifier,
};
pub use reporter::{render, summarize, write_artifacts, ArtifactPaths, HumanSummary};

pub const CRATE_NAME: &str = "bijux-drift-orchestrator";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
