use serde::{Deserialize, Serialize};

use crate::MismatchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    TrueRegression,
    ToolArtifact,
    TestArtifact,
}

impl ClassificationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrueRegression => "true_regression",
            Self::ToolArtifact => "tool_artifact",
            Self::TestArtifact => "test_artifact",
        }
    }

    /// Lower sorts first in human summaries.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::TrueRegression => 0,
            Self::ToolArtifact => 1,
            Self::TestArtifact => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub mismatch_id: MismatchId,
    pub kind: ClassificationKind,
    pub confidence: Confidence,
    pub rationale: String,
    pub needs_manual_review: bool,
}

impl Classification {
    #[must_use]
    pub fn high(mismatch_id: MismatchId, kind: ClassificationKind, rationale: &str) -> Self {
        Self {
            mismatch_id,
            kind,
            confidence: Confidence::High,
            rationale: rationale.to_string(),
            needs_manual_review: false,
        }
    }

    #[must_use]
    pub fn low(mismatch_id: MismatchId, kind: ClassificationKind, rationale: &str) -> Self {
        Self {
            mismatch_id,
            kind,
            confidence: Confidence::Low,
            rationale: rationale.to_string(),
            needs_manual_review: true,
        }
    }

    #[must_use]
    pub fn is_low_confidence(&self) -> bool {
        self.confidence == Confidence::Low
    }
}
