use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub const ALL: [Self; 7] = [
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Patch,
        Self::Delete,
        Self::Head,
        Self::Options,
    ];

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "patch" => Ok(Self::Patch),
            "delete" => Ok(Self::Delete),
            "head" => Ok(Self::Head),
            "options" => Ok(Self::Options),
            _ => Err(ModelError::InvalidMethod(raw.to_string())),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    #[must_use]
    pub const fn as_lower(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Head => "head",
            Self::Options => "options",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapses every parameter segment (`{id}`, `:id`, `${id}`) to `{}` so the
/// three artifacts agree on endpoint identity regardless of their syntax.
#[must_use]
pub fn normalize_path_template(raw: &str) -> String {
    let without_query = raw.trim().split('?').next().unwrap_or_default();
    let segments = without_query
        .split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            if seg.starts_with(':') || seg.contains('{') {
                "{}"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub method: HttpMethod,
    pub template: String,
}

impl EndpointKey {
    #[must_use]
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            template: normalize_path_template(path),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub key: EndpointKey,
    pub path: String,
    pub operation_id: Option<String>,
    pub params: Vec<String>,
    pub request_schema: Option<String>,
    pub response_schema: Option<String>,
}

impl Endpoint {
    #[must_use]
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            key: EndpointKey::new(method, path),
            path: path.trim().to_string(),
            operation_id: None,
            params: Vec::new(),
            request_schema: None,
            response_schema: None,
        }
    }

    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.key.method
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key.method, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Spec,
    Client,
    Server,
    ResponseSpec,
    ResponseClient,
    ResponseServer,
}

impl Layer {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Client => "client",
            Self::Server => "server",
            Self::ResponseSpec => "response_spec",
            Self::ResponseClient => "response_client",
            Self::ResponseServer => "response_server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Spec,
    Client,
    Server,
}

impl ArtifactKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub type_name: Option<String>,
    pub required: bool,
}

impl FieldSpec {
    #[must_use]
    pub fn untyped() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn typed(type_name: &str, required: bool) -> Self {
        Self {
            type_name: Some(type_name.to_string()),
            required,
        }
    }
}

/// Named set of field identifiers. Equality compares fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSet {
    pub name: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl PartialEq for FieldSet {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for FieldSet {}

impl FieldSet {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn from_names<I, S>(name: &str, names: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new(name);
        for field in names {
            set.insert(field.as_ref(), FieldSpec::untyped())?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, field: &str, spec: FieldSpec) -> Result<(), ModelError> {
        let key = field.trim();
        if self.fields.contains_key(key) {
            return Err(ModelError::DuplicateField {
                set: self.name.clone(),
                field: key.to_string(),
            });
        }
        self.fields.insert(key.to_string(), spec);
        Ok(())
    }

    /// Adds fields from `other` that are not present yet; existing specs win.
    pub fn absorb(&mut self, other: &FieldSet) {
        for (name, spec) in &other.fields {
            self.fields
                .entry(name.clone())
                .or_insert_with(|| spec.clone());
        }
    }

    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }

    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        self.fields.keys().cloned().collect()
    }

    /// Fields in `self` that `other` lacks.
    #[must_use]
    pub fn missing_from(&self, other: &FieldSet) -> BTreeSet<String> {
        self.fields
            .keys()
            .filter(|name| !other.fields.contains_key(*name))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn symmetric_difference(&self, other: &FieldSet) -> BTreeSet<String> {
        let mut out = self.missing_from(other);
        out.extend(other.missing_from(self));
        out
    }

    /// Shared fields where both sides declare a type and the types differ.
    #[must_use]
    pub fn type_conflicts(&self, other: &FieldSet) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter_map(|(name, spec)| {
                let theirs = other.fields.get(name)?;
                match (&spec.type_name, &theirs.type_name) {
                    (Some(a), Some(b)) if !a.eq_ignore_ascii_case(b) => Some(name.clone()),
                    _ => None,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub artifact: ArtifactKind,
    pub endpoint: EndpointKey,
    pub location: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLayers {
    pub endpoint: Endpoint,
    pub layers: BTreeMap<Layer, FieldSet>,
}

/// One artifact's view of the API surface. Every endpoint carries at least one
/// populated layer; endpoints that could not be extracted live in `failures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractModel {
    pub artifact: ArtifactKind,
    endpoints: BTreeMap<EndpointKey, EndpointLayers>,
    failures: BTreeMap<EndpointKey, ExtractionFailure>,
}

impl ContractModel {
    #[must_use]
    pub fn builder(artifact: ArtifactKind) -> ContractModelBuilder {
        ContractModelBuilder {
            artifact,
            endpoints: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn empty(artifact: ArtifactKind) -> Self {
        Self {
            artifact,
            endpoints: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointLayers> {
        self.endpoints.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EndpointKey> {
        self.endpoints.keys()
    }

    #[must_use]
    pub fn get(&self, key: &EndpointKey) -> Option<&EndpointLayers> {
        self.endpoints.get(key)
    }

    #[must_use]
    pub fn layer(&self, key: &EndpointKey, layer: Layer) -> Option<&FieldSet> {
        self.endpoints.get(key).and_then(|e| e.layers.get(&layer))
    }

    #[must_use]
    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.endpoints.contains_key(key)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExtractionFailure> {
        self.failures.values()
    }

    #[must_use]
    pub fn is_failed(&self, key: &EndpointKey) -> bool {
        self.failures.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[derive(Debug)]
pub struct ContractModelBuilder {
    artifact: ArtifactKind,
    endpoints: BTreeMap<EndpointKey, EndpointLayers>,
    failures: BTreeMap<EndpointKey, ExtractionFailure>,
}

impl ContractModelBuilder {
    fn entry(&mut self, endpoint: &Endpoint) -> Option<&mut EndpointLayers> {
        if self.failures.contains_key(&endpoint.key) {
            return None;
        }
        Some(
            self.endpoints
                .entry(endpoint.key.clone())
                .or_insert_with(|| EndpointLayers {
                    endpoint: endpoint.clone(),
                    layers: BTreeMap::new(),
                }),
        )
    }

    /// Registers an endpoint; `build` rejects it unless a layer is set later.
    pub fn declare(&mut self, endpoint: &Endpoint) {
        let _ = self.entry(endpoint);
    }

    /// Replaces the layer. Ignored for endpoints already marked failed.
    pub fn set_layer(&mut self, endpoint: &Endpoint, layer: Layer, fields: FieldSet) {
        if let Some(entry) = self.entry(endpoint) {
            entry.layers.insert(layer, fields);
        }
    }

    /// Unions the layer with what was already observed for the endpoint.
    pub fn merge_layer(&mut self, endpoint: &Endpoint, layer: Layer, fields: FieldSet) {
        if let Some(entry) = self.entry(endpoint) {
            match entry.layers.get_mut(&layer) {
                Some(existing) => existing.absorb(&fields),
                None => {
                    entry.layers.insert(layer, fields);
                }
            }
        }
    }

    /// Drops any partial layers for the endpoint and records the failure.
    pub fn mark_failed(&mut self, key: &EndpointKey, location: Option<String>, reason: &str) {
        self.endpoints.remove(key);
        let artifact = self.artifact;
        self.failures
            .entry(key.clone())
            .or_insert_with(|| ExtractionFailure {
                artifact,
                endpoint: key.clone(),
                location,
                reason: reason.to_string(),
            });
    }

    pub fn build(self) -> Result<ContractModel, ModelError> {
        if let Some((key, _)) = self
            .endpoints
            .iter()
            .find(|(_, entry)| entry.layers.is_empty())
        {
            return Err(ModelError::EmptyEndpoint(key.to_string()));
        }
        Ok(ContractModel {
            artifact: self.artifact,
            endpoints: self.endpoints,
            failures: self.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_normalize_across_syntaxes() {
        assert_eq!(normalize_path_template("/users/{id}"), "/users/{}");
        assert_eq!(normalize_path_template("/users/:id/"), "/users/{}");
        assert_eq!(normalize_path_template("/users/${user.id}?x=1"), "/users/{}");
        assert_eq!(normalize_path_template(""), "/");
    }

    #[test]
    fn field_set_rejects_duplicate_names() {
        let mut set = FieldSet::new("CreateUser");
        set.insert("email", FieldSpec::untyped()).expect("first");
        let err = set
            .insert("email", FieldSpec::typed("string", true))
            .expect_err("duplicate");
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn field_set_equality_is_set_based() {
        let a = FieldSet::from_names("a", ["x", "y"]).expect("a");
        let b = FieldSet::from_names("b", ["y", "x"]).expect("b");
        assert_eq!(a, b);
        assert!(a.symmetric_difference(&b).is_empty());
    }

    #[test]
    fn type_conflicts_ignore_untyped_sides() {
        let mut a = FieldSet::new("a");
        a.insert("age", FieldSpec::typed("integer", true)).expect("a");
        a.insert("name", FieldSpec::typed("string", true)).expect("a");
        let mut b = FieldSet::new("b");
        b.insert("age", FieldSpec::typed("string", true)).expect("b");
        b.insert("name", FieldSpec::untyped()).expect("b");
        assert_eq!(
            a.type_conflicts(&b).into_iter().collect::<Vec<_>>(),
            vec!["age".to_string()]
        );
    }

    #[test]
    fn builder_isolates_failed_endpoints() {
        let ok = Endpoint::new(HttpMethod::Get, "/a");
        let bad = Endpoint::new(HttpMethod::Post, "/b");
        let mut builder = ContractModel::builder(ArtifactKind::Spec);
        builder.set_layer(&ok, Layer::Spec, FieldSet::new("a"));
        builder.set_layer(&bad, Layer::Spec, FieldSet::new("b"));
        builder.mark_failed(&bad.key, None, "unresolved $ref");
        builder.set_layer(&bad, Layer::ResponseSpec, FieldSet::new("b"));
        let model = builder.build().expect("model");
        assert_eq!(model.len(), 1);
        assert!(model.is_failed(&bad.key));
        assert!(model.get(&bad.key).is_none());
    }

    #[test]
    fn merge_layer_unions_observations() {
        let ep = Endpoint::new(HttpMethod::Post, "/x");
        let mut builder = ContractModel::builder(ArtifactKind::Client);
        builder.merge_layer(&ep, Layer::Client, FieldSet::from_names("c", ["a"]).expect("a"));
        builder.merge_layer(&ep, Layer::Client, FieldSet::new("c"));
        builder.merge_layer(&ep, Layer::Client, FieldSet::from_names("c", ["b"]).expect("b"));
        let model = builder.build().expect("model");
        let layer = model.layer(&ep.key, Layer::Client).expect("layer");
        assert_eq!(layer.names().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
