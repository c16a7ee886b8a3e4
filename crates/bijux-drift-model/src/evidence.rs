use serde::{Deserialize, Serialize};

use crate::MismatchId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSite {
    pub file: String,
    pub line: Option<u32>,
    pub symbol: String,
}

impl SourceSite {
    #[must_use]
    pub fn new(file: &str, line: Option<u32>, symbol: &str) -> Self {
        Self {
            file: file.to_string(),
            line,
            symbol: symbol.to_string(),
        }
    }
}

/// Locations a remediation may touch, as far as they could be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationSites {
    pub router: Option<SourceSite>,
    pub handler: Option<SourceSite>,
    pub request_struct: Option<SourceSite>,
    pub response_struct: Option<SourceSite>,
}

/// Facts gathered for one mismatch. `None` means the fact could not be
/// determined; the trace says why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub mismatch_id: MismatchId,
    pub handler_exists: Option<bool>,
    pub routing_correct: Option<bool>,
    pub recent_regeneration: Option<bool>,
    pub trace: Vec<String>,
    #[serde(default)]
    pub sites: RemediationSites,
}

impl Evidence {
    #[must_use]
    pub fn new(mismatch_id: MismatchId) -> Self {
        Self {
            mismatch_id,
            handler_exists: None,
            routing_correct: None,
            recent_regeneration: None,
            trace: Vec::new(),
            sites: RemediationSites::default(),
        }
    }

    pub fn note(&mut self, line: impl Into<String>) {
        self.trace.push(line.into());
    }

    #[must_use]
    pub fn unknown_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.handler_exists.is_none() {
            out.push("handler_exists");
        }
        if self.routing_correct.is_none() {
            out.push("routing_correct");
        }
        if self.recent_regeneration.is_none() {
            out.push("recent_regeneration");
        }
        out
    }

    #[must_use]
    pub fn has_unknown(&self) -> bool {
        !self.unknown_fields().is_empty()
    }

    #[must_use]
    pub fn trace_text(&self) -> String {
        self.trace.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_evidence_reports_every_field_unknown() {
        let id = MismatchId::parse("mm_0000000000000001").expect("id");
        let mut ev = Evidence::new(id);
        assert_eq!(ev.unknown_fields().len(), 3);
        ev.handler_exists = Some(true);
        ev.routing_correct = Some(false);
        ev.recent_regeneration = Some(true);
        assert!(!ev.has_unknown());
    }
}
