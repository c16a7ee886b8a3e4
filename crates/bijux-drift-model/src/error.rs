use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelError {
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: String,
    },
    InvalidMethod(String),
    DuplicateField {
        set: String,
        field: String,
    },
    EmptyEndpoint(String),
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    PatchAnchorMissing {
        anchor: String,
    },
    PatchLineMissing {
        line: String,
    },
    InconsistentRelations(String),
    Encode(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentifier {
                kind,
                value,
                reason,
            } => write!(f, "invalid {kind} `{value}`: {reason}"),
            Self::InvalidMethod(raw) => write!(f, "unsupported http method `{raw}`"),
            Self::DuplicateField { set, field } => {
                write!(f, "field set `{set}` already contains field `{field}`")
            }
            Self::EmptyEndpoint(key) => {
                write!(f, "endpoint {key} has no populated layer")
            }
            Self::IllegalTransition { entity, from, to } => {
                write!(f, "illegal {entity} transition {from} -> {to}")
            }
            Self::PatchAnchorMissing { anchor } => {
                write!(f, "patch anchor not found: `{anchor}`")
            }
            Self::PatchLineMissing { line } => write!(f, "patch line not found: `{line}`"),
            Self::InconsistentRelations(detail) => {
                write!(f, "duplicate relations inconsistent: {detail}")
            }
            Self::Encode(detail) => write!(f, "canonical encoding failed: {detail}"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<serde_json::Error> for ModelError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value.to_string())
    }
}
