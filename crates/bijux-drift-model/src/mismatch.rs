use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{EndpointKey, Layer, MismatchId, ModelError};

/// Ordered layer pairs compared for every endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerPair {
    SpecClientRequest,
    SpecServerRequest,
    SpecClientResponse,
    SpecServerResponse,
}

impl LayerPair {
    pub const MATRIX: [Self; 4] = [
        Self::SpecClientRequest,
        Self::SpecServerRequest,
        Self::SpecClientResponse,
        Self::SpecServerResponse,
    ];

    #[must_use]
    pub const fn left(self) -> Layer {
        match self {
            Self::SpecClientRequest | Self::SpecServerRequest => Layer::Spec,
            Self::SpecClientResponse | Self::SpecServerResponse => Layer::ResponseSpec,
        }
    }

    #[must_use]
    pub const fn right(self) -> Layer {
        match self {
            Self::SpecClientRequest => Layer::Client,
            Self::SpecServerRequest => Layer::Server,
            Self::SpecClientResponse => Layer::ResponseClient,
            Self::SpecServerResponse => Layer::ResponseServer,
        }
    }

    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::SpecClientResponse | Self::SpecServerResponse)
    }

    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::SpecServerRequest | Self::SpecServerResponse)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpecClientRequest => "spec_client_request",
            Self::SpecServerRequest => "spec_server_request",
            Self::SpecClientResponse => "spec_client_response",
            Self::SpecServerResponse => "spec_server_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    FieldMissing,
    FieldExtra,
    TypeMismatch,
    ResponseMismatch,
}

impl MismatchKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FieldMissing => "field_missing",
            Self::FieldExtra => "field_extra",
            Self::TypeMismatch => "type_mismatch",
            Self::ResponseMismatch => "response_mismatch",
        }
    }
}

#[derive(Serialize)]
struct MismatchIdentity<'a> {
    endpoint: String,
    pair: &'a str,
    kind: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub id: MismatchId,
    pub endpoint: EndpointKey,
    pub pair: LayerPair,
    pub kind: MismatchKind,
    pub missing: BTreeSet<String>,
    pub extra: BTreeSet<String>,
    pub type_conflicts: BTreeSet<String>,
    pub difference: BTreeSet<String>,
    #[serde(default)]
    pub endpoint_absent: bool,
}

impl Mismatch {
    /// Identity is a hash of (endpoint, pair, kind) only; the field sets do not
    /// participate so that the id is stable while the difference evolves.
    pub fn new(
        endpoint: EndpointKey,
        pair: LayerPair,
        kind: MismatchKind,
        missing: BTreeSet<String>,
        extra: BTreeSet<String>,
        type_conflicts: BTreeSet<String>,
    ) -> Result<Self, ModelError> {
        let id = Self::identity(&endpoint, pair, kind)?;
        let mut difference = missing.clone();
        difference.extend(extra.iter().cloned());
        difference.extend(type_conflicts.iter().cloned());
        Ok(Self {
            id,
            endpoint,
            pair,
            kind,
            missing,
            extra,
            type_conflicts,
            difference,
            endpoint_absent: false,
        })
    }

    pub fn identity(
        endpoint: &EndpointKey,
        pair: LayerPair,
        kind: MismatchKind,
    ) -> Result<MismatchId, ModelError> {
        let hashed = bijux_drift_core::short_content_id(
            "mm",
            &MismatchIdentity {
                endpoint: endpoint.to_string(),
                pair: pair.as_str(),
                kind: kind.as_str(),
            },
        )?;
        Ok(MismatchId::from_hashed(hashed))
    }

    #[must_use]
    pub fn absent(mut self) -> Self {
        self.endpoint_absent = true;
        self
    }

    #[must_use]
    pub fn describe(&self) -> String {
        let fields = if self.difference.is_empty() {
            "endpoint absent".to_string()
        } else {
            self.difference
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{} {} on {}: {}",
            self.kind.as_str(),
            self.pair.as_str(),
            self.endpoint,
            fields
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpMethod;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn identity_ignores_field_contents() {
        let key = EndpointKey::new(HttpMethod::Post, "/x");
        let a = Mismatch::new(
            key.clone(),
            LayerPair::SpecClientRequest,
            MismatchKind::FieldMissing,
            set(&["a"]),
            BTreeSet::new(),
            BTreeSet::new(),
        )
        .expect("a");
        let b = Mismatch::new(
            key,
            LayerPair::SpecClientRequest,
            MismatchKind::FieldMissing,
            set(&["a", "b", "c"]),
            BTreeSet::new(),
            BTreeSet::new(),
        )
        .expect("b");
        assert_eq!(a.id, b.id);
        assert!(MismatchId::parse(a.id.as_str()).is_ok());
    }

    #[test]
    fn identity_differs_per_pair() {
        let key = EndpointKey::new(HttpMethod::Get, "/users/{id}");
        let a = Mismatch::identity(&key, LayerPair::SpecServerRequest, MismatchKind::FieldExtra)
            .expect("a");
        let b = Mismatch::identity(&key, LayerPair::SpecClientRequest, MismatchKind::FieldExtra)
            .expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn difference_is_union_of_parts() {
        let m = Mismatch::new(
            EndpointKey::new(HttpMethod::Get, "/r"),
            LayerPair::SpecServerResponse,
            MismatchKind::ResponseMismatch,
            set(&["a"]),
            set(&["z"]),
            set(&["t"]),
        )
        .expect("m");
        assert_eq!(m.difference, set(&["a", "t", "z"]));
    }

    #[test]
    fn matrix_pairs_map_to_layers() {
        assert_eq!(LayerPair::SpecClientResponse.right(), Layer::ResponseClient);
        assert!(LayerPair::SpecServerResponse.is_response());
        assert!(!LayerPair::SpecClientRequest.is_server());
    }
}
