// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod classification;
mod contract;
mod error;
mod evidence;
mod fix;
mod ids;
mod issue;
mod mismatch;
mod report;

pub use classification::{Classification, ClassificationKind, Confidence};
pub use contract::{
    normalize_path_template, ArtifactKind, ContractModel, ContractModelBuilder, Endpoint,
    EndpointKey, EndpointLayers, ExtractionFailure, FieldSet, FieldSpec, HttpMethod, Layer,
};
pub use error::ModelError;
pub use evidence::{Evidence, RemediationSites, SourceSite};
pub use fix::{apply_patch, Fix, FixKind, FixStatus, PatchOp, VerificationCheck};
pub use ids::{FixId, IssueId, MismatchId, RunId, TicketId};
pub use issue::{IssueRecord, IssueStatus, Severity};
pub use mismatch::{LayerPair, Mismatch, MismatchKind};
pub use report::{
    ApprovalDecision, ApprovalEvent, NoteKind, RunCounts, RunNote, RunReport, RunReportDraft,
    RunState, Stage, StateTransition, REPORT_SCHEMA_VERSION,
};

pub const CRATE_NAME: &str = "bijux-drift-model";

pub(crate) fn is_lower_snake(input: &str) -> bool {
    !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
