use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    Classification, ClassificationKind, Evidence, ExtractionFailure, Fix, FixId, FixStatus,
    IssueId, IssueRecord, Mismatch, MismatchId, ModelError, RunId, TicketId,
};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Collecting,
    Analyzing,
    Planning,
    AwaitingApproval,
    Applying,
    Verifying,
    Committed,
    RolledBack,
    Reporting,
    Done,
}

impl RunState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Verifying => "verifying",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Reporting => "reporting",
            Self::Done => "done",
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Done, _) | (Self::Reporting, Self::Reporting) => false,
            (Self::Reporting, Self::Done) | (_, Self::Reporting) => true,
            (Self::Collecting, Self::Analyzing)
            | (Self::Analyzing, Self::Planning)
            | (Self::Planning, Self::AwaitingApproval)
            | (Self::Planning, Self::Applying)
            | (Self::AwaitingApproval, Self::Applying)
            | (Self::Applying, Self::Verifying)
            | (Self::Applying, Self::RolledBack)
            | (Self::Verifying, Self::Committed)
            | (Self::Verifying, Self::RolledBack)
            | (Self::Committed, Self::Applying)
            | (Self::RolledBack, Self::Applying) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collecting,
    Analyzing,
    Planning,
    Approval,
    Applying,
    Verifying,
    Reporting,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::Approval => "approval",
            Self::Applying => "applying",
            Self::Verifying => "verifying",
            Self::Reporting => "reporting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub reason: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Reject,
}

impl ApprovalDecision {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            _ => Err(ModelError::InvalidIdentifier {
                kind: "approval decision",
                value: raw.to_string(),
                reason: "expected accept|reject".to_string(),
            }),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub run_id: RunId,
    pub decision: ApprovalDecision,
    pub fix_ids: Vec<FixId>,
    pub at_ms: u64,
    pub source: String,
}

impl ApprovalEvent {
    #[must_use]
    pub fn covers(&self, fix: &FixId) -> bool {
        self.decision == ApprovalDecision::Accept && self.fix_ids.contains(fix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    ExtractionFailure,
    EvidenceIncomplete,
    ClassificationLowConfidence,
    FixApplicationFailure,
    ApprovalTimeout,
    StageTimeout,
    Cancelled,
    TicketingFailure,
    IssueStoreFailure,
    NotificationFailure,
}

impl NoteKind {
    /// Notes that mark a result as partial.
    #[must_use]
    pub const fn is_incomplete(self) -> bool {
        matches!(
            self,
            Self::ExtractionFailure | Self::EvidenceIncomplete | Self::StageTimeout | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNote {
    pub kind: NoteKind,
    pub subject: String,
    pub detail: String,
    pub stage: Stage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub mismatches: u64,
    pub true_regression: u64,
    pub tool_artifact: u64,
    pub test_artifact: u64,
    pub low_confidence: u64,
    pub incomplete: u64,
    pub skipped: u64,
    pub fixes_proposed: u64,
    pub fixes_verified: u64,
    pub fixes_rolled_back: u64,
    pub regressions_open: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: RunId,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub stage_durations_ms: BTreeMap<Stage, u64>,
    pub final_state: RunState,
    pub transitions: Vec<StateTransition>,
    pub extraction_failures: Vec<ExtractionFailure>,
    pub mismatches: Vec<Mismatch>,
    pub evidence: Vec<Evidence>,
    pub classifications: Vec<Classification>,
    pub fixes: Vec<Fix>,
    pub approvals: Vec<ApprovalEvent>,
    pub notes: Vec<RunNote>,
    pub issues: Vec<IssueRecord>,
    pub tickets: BTreeMap<IssueId, TicketId>,
    pub cancelled: bool,
    pub fatal: Option<String>,
    pub counts: RunCounts,
}

impl RunReport {
    #[must_use]
    pub fn classification_for(&self, id: &MismatchId) -> Option<&Classification> {
        self.classifications.iter().find(|c| &c.mismatch_id == id)
    }

    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.counts.incomplete > 0 || self.fatal.is_some()
    }
}

/// Mutable accumulator for a run in progress. `finalize` freezes it.
#[derive(Debug, Clone)]
pub struct RunReportDraft {
    pub run_id: RunId,
    pub started_at_ms: u64,
    pub state: RunState,
    pub stage_durations_ms: BTreeMap<Stage, u64>,
    pub transitions: Vec<StateTransition>,
    pub extraction_failures: Vec<ExtractionFailure>,
    pub mismatches: Vec<Mismatch>,
    pub evidence: Vec<Evidence>,
    pub classifications: Vec<Classification>,
    pub fixes: Vec<Fix>,
    pub approvals: Vec<ApprovalEvent>,
    pub notes: Vec<RunNote>,
    pub issues: Vec<IssueRecord>,
    pub tickets: BTreeMap<IssueId, TicketId>,
    pub cancelled: bool,
    pub fatal: Option<String>,
}

impl RunReportDraft {
    #[must_use]
    pub fn new(run_id: RunId, started_at_ms: u64) -> Self {
        Self {
            run_id,
            started_at_ms,
            state: RunState::Collecting,
            stage_durations_ms: BTreeMap::new(),
            transitions: Vec::new(),
            extraction_failures: Vec::new(),
            mismatches: Vec::new(),
            evidence: Vec::new(),
            classifications: Vec::new(),
            fixes: Vec::new(),
            approvals: Vec::new(),
            notes: Vec::new(),
            issues: Vec::new(),
            tickets: BTreeMap::new(),
            cancelled: false,
            fatal: None,
        }
    }

    pub fn transition(&mut self, to: RunState, reason: &str, at_ms: u64) -> Result<(), ModelError> {
        if !self.state.can_transition_to(to) {
            return Err(ModelError::IllegalTransition {
                entity: "run",
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            reason: reason.to_string(),
            at_ms,
        });
        self.state = to;
        Ok(())
    }

    pub fn note(&mut self, kind: NoteKind, stage: Stage, subject: &str, detail: &str) {
        self.notes.push(RunNote {
            kind,
            subject: subject.to_string(),
            detail: detail.to_string(),
            stage,
        });
    }

    #[must_use]
    pub fn has_accepted_approval(&self, fix: &FixId) -> bool {
        self.approvals.iter().any(|event| event.covers(fix))
    }

    #[must_use]
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts {
            mismatches: self.mismatches.len() as u64,
            ..RunCounts::default()
        };
        for c in &self.classifications {
            match c.kind {
                ClassificationKind::TrueRegression => counts.true_regression += 1,
                ClassificationKind::ToolArtifact => counts.tool_artifact += 1,
                ClassificationKind::TestArtifact => counts.test_artifact += 1,
            }
            if c.is_low_confidence() {
                counts.low_confidence += 1;
            }
        }
        counts.incomplete = self.notes.iter().filter(|n| n.kind.is_incomplete()).count() as u64;
        counts.fixes_proposed = self.fixes.len() as u64;
        for fix in &self.fixes {
            match fix.status {
                FixStatus::Verified => counts.fixes_verified += 1,
                FixStatus::RolledBack => counts.fixes_rolled_back += 1,
                FixStatus::Skipped => counts.skipped += 1,
                FixStatus::Proposed | FixStatus::Applied => {}
            }
        }
        let repaired = self
            .fixes
            .iter()
            .filter(|fix| fix.status == FixStatus::Verified)
            .flat_map(|fix| fix.mismatch_ids.iter())
            .collect::<BTreeSet<_>>();
        counts.regressions_open = self
            .classifications
            .iter()
            .filter(|c| c.kind == ClassificationKind::TrueRegression)
            .filter(|c| !repaired.contains(&c.mismatch_id))
            .count() as u64;
        counts
    }

    #[must_use]
    pub fn finalize(self, finished_at_ms: u64) -> RunReport {
        let counts = self.counts();
        RunReport {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: self.run_id,
            started_at_ms: self.started_at_ms,
            finished_at_ms,
            stage_durations_ms: self.stage_durations_ms,
            final_state: self.state,
            transitions: self.transitions,
            extraction_failures: self.extraction_failures,
            mismatches: self.mismatches,
            evidence: self.evidence,
            classifications: self.classifications,
            fixes: self.fixes,
            approvals: self.approvals,
            notes: self.notes,
            issues: self.issues,
            tickets: self.tickets,
            cancelled: self.cancelled,
            fatal: self.fatal,
            counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let path = [
            RunState::Collecting,
            RunState::Analyzing,
            RunState::Planning,
            RunState::AwaitingApproval,
            RunState::Applying,
            RunState::Verifying,
            RunState::Committed,
            RunState::Applying,
            RunState::Verifying,
            RunState::RolledBack,
            RunState::Reporting,
            RunState::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn guard_rejects_skipping_stages() {
        assert!(!RunState::Collecting.can_transition_to(RunState::Applying));
        assert!(!RunState::AwaitingApproval.can_transition_to(RunState::Verifying));
        assert!(!RunState::Done.can_transition_to(RunState::Reporting));
        assert!(RunState::Collecting.can_transition_to(RunState::Reporting));
    }

    #[test]
    fn draft_records_transitions_with_reasons() {
        let mut draft = RunReportDraft::new(RunId::parse("r1").expect("id"), 10);
        draft
            .transition(RunState::Reporting, "stage timeout", 11)
            .expect("reporting");
        assert!(draft.transition(RunState::Analyzing, "late", 12).is_err());
        draft.transition(RunState::Done, "reported", 13).expect("done");
        let report = draft.finalize(14);
        assert_eq!(report.final_state, RunState::Done);
        assert_eq!(report.transitions.len(), 2);
        assert_eq!(report.transitions[0].reason, "stage timeout");
    }
}
