use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{is_lower_snake, ModelError};

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

fn invalid(kind: &'static str, value: &str, reason: &str) -> ModelError {
    ModelError::InvalidIdentifier {
        kind,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn is_hex16_with_prefix(raw: &str, prefix: &str) -> bool {
    raw.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let raw = value.trim();
        if raw.is_empty() {
            return Err(invalid("run id", raw, "cannot be empty"));
        }
        if !is_lower_snake(raw) {
            return Err(invalid("run id", raw, "expected lowercase snake_case"));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn from_seed(seed: &str) -> Self {
        let mut out = String::with_capacity(seed.len());
        for c in seed.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_lowercase());
            } else {
                out.push('_');
            }
        }
        let compact = out
            .split('_')
            .filter(|seg| !seg.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        if compact.is_empty() {
            return Self("run".to_string());
        }
        Self(compact)
    }
}

string_id!(RunId);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(String);

impl IssueId {
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let raw = value.trim();
        if raw.is_empty() {
            return Err(invalid("issue id", raw, "cannot be empty"));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("issue id", raw, "expected [A-Za-z0-9_-]"));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("ISS-{seq:06}"))
    }
}

string_id!(IssueId);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MismatchId(String);

impl MismatchId {
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let raw = value.trim();
        if !is_hex16_with_prefix(raw, "mm") {
            return Err(invalid("mismatch id", raw, "expected mm_<16 hex>"));
        }
        Ok(Self(raw.to_string()))
    }

    pub(crate) fn from_hashed(value: String) -> Self {
        Self(value)
    }
}

string_id!(MismatchId);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixId(String);

impl FixId {
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let raw = value.trim();
        if !is_hex16_with_prefix(raw, "fix") {
            return Err(invalid("fix id", raw, "expected fix_<16 hex>"));
        }
        Ok(Self(raw.to_string()))
    }

    pub(crate) fn from_hashed(value: String) -> Self {
        Self(value)
    }
}

string_id!(FixId);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let raw = value.trim();
        if raw.is_empty() {
            return Err(invalid("ticket id", raw, "cannot be empty"));
        }
        Ok(Self(raw.to_string()))
    }
}

string_id!(TicketId);
