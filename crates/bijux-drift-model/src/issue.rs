use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{IssueId, MismatchId, ModelError, TicketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Untracked,
    Tracked,
    Resolved,
    Duplicate,
}

impl IssueStatus {
    pub const ALL: [Self; 4] = [
        Self::Untracked,
        Self::Tracked,
        Self::Resolved,
        Self::Duplicate,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Untracked => "untracked",
            Self::Tracked => "tracked",
            Self::Resolved => "resolved",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == raw.trim().to_ascii_lowercase())
            .ok_or_else(|| ModelError::InvalidIdentifier {
                kind: "issue status",
                value: raw.to_string(),
                reason: "expected untracked|tracked|resolved|duplicate".to_string(),
            })
    }

    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Untracked, Self::Tracked)
                | (Self::Untracked, Self::Resolved)
                | (Self::Untracked, Self::Duplicate)
                | (Self::Tracked, Self::Resolved)
                | (Self::Tracked, Self::Duplicate)
                | (Self::Duplicate, Self::Untracked)
                | (Self::Duplicate, Self::Tracked)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: IssueId,
    pub created_at_ms: u64,
    pub severity: Severity,
    pub component: String,
    pub status: IssueStatus,
    pub symptom: String,
    pub reproduction_steps: Vec<String>,
    pub files: BTreeSet<String>,
    pub mismatch_id: Option<MismatchId>,
    pub ticket: Option<TicketId>,
    pub potential_duplicates_of: BTreeSet<IssueId>,
    pub duplicated_by: BTreeSet<IssueId>,
}

impl IssueRecord {
    #[must_use]
    pub fn new(id: IssueId, created_at_ms: u64, component: &str, symptom: &str) -> Self {
        Self {
            id,
            created_at_ms,
            severity: Severity::Medium,
            component: component.to_string(),
            status: IssueStatus::Untracked,
            symptom: symptom.to_string(),
            reproduction_steps: Vec::new(),
            files: BTreeSet::new(),
            mismatch_id: None,
            ticket: None,
            potential_duplicates_of: BTreeSet::new(),
            duplicated_by: BTreeSet::new(),
        }
    }

    fn illegal(&self, to: IssueStatus) -> ModelError {
        ModelError::IllegalTransition {
            entity: "issue",
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    pub fn transition(&mut self, to: IssueStatus) -> Result<(), ModelError> {
        if !self.status.can_transition_to(to) {
            return Err(self.illegal(to));
        }
        if self.status == IssueStatus::Duplicate && self.is_linked_duplicate() {
            return Err(self.illegal(to));
        }
        self.status = to;
        Ok(())
    }

    /// Automated filing path: only untracked records that are not linked as a
    /// duplicate of another record receive a ticket.
    pub fn attach_ticket(&mut self, ticket: TicketId) -> Result<(), ModelError> {
        if self.status != IssueStatus::Untracked || self.is_linked_duplicate() {
            return Err(self.illegal(IssueStatus::Tracked));
        }
        self.ticket = Some(ticket);
        self.status = IssueStatus::Tracked;
        Ok(())
    }

    /// Operator override. Duplicate records keep their status.
    pub fn force_ticket(&mut self, ticket: TicketId) -> Result<(), ModelError> {
        if self.status == IssueStatus::Resolved {
            return Err(self.illegal(IssueStatus::Tracked));
        }
        self.ticket = Some(ticket);
        if self.status == IssueStatus::Untracked {
            self.status = IssueStatus::Tracked;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_linked_duplicate(&self) -> bool {
        !self.potential_duplicates_of.is_empty()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.status, IssueStatus::Untracked | IssueStatus::Tracked)
    }

    #[must_use]
    pub fn wants_ticket(&self) -> bool {
        self.status == IssueStatus::Untracked && self.ticket.is_none() && !self.is_linked_duplicate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> IssueRecord {
        IssueRecord::new(IssueId::from_sequence(seq), seq, "Backend Auth", "login fails")
    }

    #[test]
    fn resolved_is_terminal() {
        let mut r = record(1);
        r.transition(IssueStatus::Resolved).expect("resolve");
        for to in IssueStatus::ALL {
            assert!(r.transition(to).is_err(), "resolved -> {to:?}");
        }
    }

    #[test]
    fn duplicate_reopens_only_after_relations_clear() {
        let mut r = record(2);
        r.potential_duplicates_of.insert(IssueId::from_sequence(1));
        r.transition(IssueStatus::Duplicate).expect("dup");
        assert!(r.transition(IssueStatus::Untracked).is_err());
        r.potential_duplicates_of.clear();
        r.transition(IssueStatus::Untracked).expect("reopen");
    }

    #[test]
    fn automated_ticket_skips_linked_duplicates() {
        let mut r = record(3);
        r.potential_duplicates_of.insert(IssueId::from_sequence(1));
        assert!(!r.wants_ticket());
        assert!(r
            .attach_ticket(TicketId::parse("T-1").expect("ticket"))
            .is_err());
        r.force_ticket(TicketId::parse("T-1").expect("ticket"))
            .expect("force");
        assert_eq!(r.status, IssueStatus::Tracked);
    }

    #[test]
    fn status_parse_accepts_case_variants() {
        assert_eq!(IssueStatus::parse("Tracked").expect("parse"), IssueStatus::Tracked);
        assert!(IssueStatus::parse("open").is_err());
    }
}
