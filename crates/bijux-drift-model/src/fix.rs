use serde::{Deserialize, Serialize};

use crate::{FixId, MismatchId, ModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    RestoreRoute,
    AddServerField,
    RemoveServerField,
}

impl FixKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RestoreRoute => "restore_route",
            Self::AddServerField => "add_server_field",
            Self::RemoveServerField => "remove_server_field",
        }
    }

    #[must_use]
    pub const fn is_additive(self) -> bool {
        matches!(self, Self::RestoreRoute | Self::AddServerField)
    }
}

/// Line-oriented edit. Lines are matched on their trimmed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    InsertAfter {
        anchor: String,
        lines: Vec<String>,
        #[serde(default)]
        nested: bool,
    },
    /// Removes `lines` as one contiguous block, searched after `anchor` when set.
    RemoveLines {
        #[serde(default)]
        anchor: Option<String>,
        lines: Vec<String>,
    },
}

fn indentation(line: &str) -> &str {
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}

impl PatchOp {
    pub fn apply(&self, text: &str) -> Result<String, ModelError> {
        let mut lines = text.split('\n').map(str::to_string).collect::<Vec<_>>();
        match self {
            Self::InsertAfter {
                anchor,
                lines: added,
                nested,
            } => {
                let needle = anchor.trim();
                let at = lines
                    .iter()
                    .position(|line| line.trim_start().starts_with(needle))
                    .ok_or_else(|| ModelError::PatchAnchorMissing {
                        anchor: needle.to_string(),
                    })?;
                let mut indent = indentation(&lines[at]).to_string();
                if *nested {
                    indent.push_str("    ");
                }
                for (offset, line) in added.iter().enumerate() {
                    lines.insert(at + 1 + offset, format!("{indent}{}", line.trim()));
                }
            }
            Self::RemoveLines {
                anchor,
                lines: removed,
            } => {
                let from = match anchor {
                    Some(anchor) => {
                        let needle = anchor.trim();
                        lines
                            .iter()
                            .position(|line| line.trim_start().starts_with(needle))
                            .ok_or_else(|| ModelError::PatchAnchorMissing {
                                anchor: needle.to_string(),
                            })?
                    }
                    None => 0,
                };
                let block = removed.iter().map(|l| l.trim()).collect::<Vec<_>>();
                let Some(first) = block.first() else {
                    return Ok(text.to_string());
                };
                let at = (from..lines.len())
                    .find(|start| {
                        block.iter().enumerate().all(|(k, want)| {
                            lines.get(start + k).is_some_and(|have| have.trim() == *want)
                        })
                    })
                    .ok_or_else(|| ModelError::PatchLineMissing {
                        line: (*first).to_string(),
                    })?;
                lines.drain(at..at + block.len());
            }
        }
        Ok(lines.join("\n"))
    }

    fn preview(&self, out: &mut Vec<String>) {
        match self {
            Self::InsertAfter { anchor, lines, .. } => {
                out.push(format!("  {}", anchor.trim()));
                out.extend(lines.iter().map(|l| format!("+ {}", l.trim())));
            }
            Self::RemoveLines { lines, .. } => {
                out.extend(lines.iter().map(|l| format!("- {}", l.trim())));
            }
        }
    }
}

/// Applies every op in order; fails on the first op that cannot be placed.
pub fn apply_patch(text: &str, ops: &[PatchOp]) -> Result<String, ModelError> {
    ops.iter().try_fold(text.to_string(), |acc, op| op.apply(&acc))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum VerificationCheck {
    FileContains { path: String, needle: String },
    FileLacks { path: String, needle: String },
}

impl VerificationCheck {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::FileContains { path, .. } | Self::FileLacks { path, .. } => path,
        }
    }

    #[must_use]
    pub fn holds_for(&self, text: &str) -> bool {
        match self {
            Self::FileContains { needle, .. } => text.contains(needle.as_str()),
            Self::FileLacks { needle, .. } => !text.contains(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Proposed,
    Applied,
    Verified,
    RolledBack,
    Skipped,
}

impl FixStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Applied => "applied",
            Self::Verified => "verified",
            Self::RolledBack => "rolled_back",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Proposed, Self::Applied)
                | (Self::Proposed, Self::Skipped)
                | (Self::Proposed, Self::RolledBack)
                | (Self::Applied, Self::Verified)
                | (Self::Applied, Self::RolledBack)
        )
    }
}

#[derive(Serialize)]
struct FixIdentity<'a> {
    mismatch_id: &'a MismatchId,
    target: &'a str,
    patch: &'a [PatchOp],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    pub id: FixId,
    pub mismatch_ids: Vec<MismatchId>,
    pub kind: FixKind,
    pub target: String,
    pub patch: Vec<PatchOp>,
    pub safe: bool,
    pub verification: Vec<VerificationCheck>,
    pub status: FixStatus,
    pub summary: String,
    pub note: Option<String>,
}

impl Fix {
    /// Safety follows the kind: only additive edits are safe.
    pub fn propose(
        mismatch_id: MismatchId,
        kind: FixKind,
        target: &str,
        patch: Vec<PatchOp>,
        verification: Vec<VerificationCheck>,
        summary: &str,
    ) -> Result<Self, ModelError> {
        let hashed = bijux_drift_core::short_content_id(
            "fix",
            &FixIdentity {
                mismatch_id: &mismatch_id,
                target,
                patch: &patch,
            },
        )?;
        Ok(Self {
            id: FixId::from_hashed(hashed),
            mismatch_ids: vec![mismatch_id],
            kind,
            target: target.to_string(),
            patch,
            safe: kind.is_additive(),
            verification,
            status: FixStatus::Proposed,
            summary: summary.to_string(),
            note: None,
        })
    }

    #[must_use]
    pub fn same_change_as(&self, other: &Fix) -> bool {
        self.target == other.target && self.patch == other.patch
    }

    pub fn mark(&mut self, to: FixStatus) -> Result<(), ModelError> {
        if !self.status.can_transition_to(to) {
            return Err(ModelError::IllegalTransition {
                entity: "fix",
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn skip(&mut self, reason: &str) -> Result<(), ModelError> {
        self.mark(FixStatus::Skipped)?;
        self.note = Some(reason.to_string());
        Ok(())
    }

    pub fn apply_to(&self, text: &str) -> Result<String, ModelError> {
        apply_patch(text, &self.patch)
    }

    #[must_use]
    pub fn diff_preview(&self) -> String {
        let mut out = vec![format!("--- {}", self.target)];
        for op in &self.patch {
            op.preview(&mut out);
        }
        out.join("\n")
    }
}
