//! Best-effort fact gathering for a mismatch. Every probe that cannot be
//! answered leaves its field unknown and says why in the trace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bijux_drift_extract::ServerIndex;
use bijux_drift_model::{Endpoint, EndpointKey, Evidence, Mismatch, SourceSite};
use serde::Deserialize;

use crate::ports::Fs;

pub const GENERATION_MARKER: &str = ".drift/generation.json";
pub const OPENAPI_GENERATOR_VERSION: &str = ".openapi-generator/VERSION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerProbe {
    pub site: SourceSite,
    pub request_struct: Option<SourceSite>,
    pub response_struct: Option<SourceSite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteProbe {
    pub site: SourceSite,
    pub handler: String,
    pub placeholder: bool,
}

/// Code-inspection collaborator. `Err` means the question could not be
/// answered; `Ok(None)` means it was answered negatively.
pub trait CodeInspector: Send + Sync {
    fn handler_for(&self, endpoint: &EndpointKey, operation_id: Option<&str>) -> Result<Option<HandlerProbe>, String>;
    fn route_for(&self, endpoint: &EndpointKey) -> Result<Option<RouteProbe>, String>;
    fn router_site(&self) -> Option<SourceSite>;
    /// Unix seconds of the last code generation run.
    fn generation_stamp(&self) -> Result<Option<u64>, String>;
    /// Unix seconds of the last modification of `file`.
    fn edit_stamp(&self, file: &str) -> Result<Option<u64>, String>;
}

#[must_use]
pub fn snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Conventional handler names for an endpoint, most specific first.
#[must_use]
pub fn handler_candidates(endpoint: &EndpointKey, operation_id: Option<&str>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(op) = operation_id {
        let name = snake_case(op);
        if !name.is_empty() {
            out.push(name);
        }
    }
    let segments = endpoint
        .template
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "{}")
        .map(snake_case)
        .collect::<Vec<_>>();
    let mut conventional = endpoint.method.as_lower().to_string();
    for seg in segments {
        conventional.push('_');
        conventional.push_str(&seg);
    }
    if !out.contains(&conventional) {
        out.push(conventional);
    }
    out
}

#[derive(Debug, Deserialize)]
struct GenerationMarker {
    generated_at: u64,
    #[serde(default)]
    files: Vec<String>,
}

/// Inspector over an extracted server index and the server source tree.
pub struct SourceTreeInspector {
    index: Arc<ServerIndex>,
    fs: Arc<dyn Fs>,
    root: PathBuf,
}

impl SourceTreeInspector {
    #[must_use]
    pub fn new(index: Arc<ServerIndex>, fs: Arc<dyn Fs>, root: &Path) -> Self {
        Self {
            index,
            fs,
            root: root.to_path_buf(),
        }
    }

    fn struct_site(&self, name: Option<&String>) -> Option<SourceSite> {
        let entry = self.index.struct_def(name?)?;
        Some(SourceSite::new(&entry.file, Some(entry.line), &entry.name))
    }

    fn probe(&self, name: &str) -> Option<HandlerProbe> {
        let handler = self.index.handler(name)?;
        Some(HandlerProbe {
            site: SourceSite::new(&handler.file, Some(handler.line), &handler.name),
            request_struct: self.struct_site(handler.request.as_ref()),
            response_struct: self.struct_site(handler.response.as_ref()),
        })
    }
}

impl CodeInspector for SourceTreeInspector {
    fn handler_for(&self, endpoint: &EndpointKey, operation_id: Option<&str>) -> Result<Option<HandlerProbe>, String> {
        if let Some(route) = self.index.route(endpoint) {
            if !route.placeholder {
                if let Some(found) = self.probe(&route.handler) {
                    return Ok(Some(found));
                }
            }
        }
        Ok(handler_candidates(endpoint, operation_id)
            .iter()
            .find_map(|name| self.probe(name)))
    }

    fn route_for(&self, endpoint: &EndpointKey) -> Result<Option<RouteProbe>, String> {
        Ok(self.index.route(endpoint).map(|route| RouteProbe {
            site: SourceSite::new(&route.file, Some(route.line), &route.text),
            handler: route.handler.clone(),
            placeholder: route.placeholder,
        }))
    }

    fn router_site(&self) -> Option<SourceSite> {
        self.index
            .routers
            .first()
            .map(|r| SourceSite::new(&r.file, Some(r.line), &r.text))
    }

    fn generation_stamp(&self) -> Result<Option<u64>, String> {
        let marker = Path::new(GENERATION_MARKER);
        if self.fs.exists(&self.root, marker) {
            let text = self
                .fs
                .read_text(&self.root, marker)
                .map_err(|err| err.to_string())?;
            let parsed: GenerationMarker = serde_json::from_str(&text)
                .map_err(|err| format!("{GENERATION_MARKER} is malformed: {err}"))?;
            tracing::debug!(files = parsed.files.len(), "generation marker read");
            return Ok(Some(parsed.generated_at));
        }
        let version = Path::new(OPENAPI_GENERATOR_VERSION);
        if self.fs.exists(&self.root, version) {
            return self
                .fs
                .modified_secs(&self.root, version)
                .map_err(|err| err.to_string());
        }
        Ok(None)
    }

    fn edit_stamp(&self, file: &str) -> Result<Option<u64>, String> {
        self.fs
            .modified_secs(&self.root, Path::new(file))
            .map_err(|err| err.to_string())
    }
}

pub struct EvidenceCollector {
    inspector: Arc<dyn CodeInspector>,
}

impl EvidenceCollector {
    #[must_use]
    pub fn new(inspector: Arc<dyn CodeInspector>) -> Self {
        Self { inspector }
    }

    /// `spec_endpoint` supplies the operation id used for handler matching.
    #[must_use]
    pub fn collect(&self, mismatch: &Mismatch, spec_endpoint: Option<&Endpoint>) -> Evidence {
        let mut ev = Evidence::new(mismatch.id.clone());
        let key = &mismatch.endpoint;
        let operation_id = spec_endpoint.and_then(|e| e.operation_id.as_deref());
        ev.sites.router = self.inspector.router_site();

        let handler = match self.inspector.handler_for(key, operation_id) {
            Ok(Some(probe)) => {
                ev.note(format!(
                    "handler `{}` found at {}:{}",
                    probe.site.symbol,
                    probe.site.file,
                    probe.site.line.unwrap_or(0)
                ));
                ev.handler_exists = Some(true);
                ev.sites.request_struct = probe.request_struct.clone();
                ev.sites.response_struct = probe.response_struct.clone();
                ev.sites.handler = Some(probe.site.clone());
                Some(probe)
            }
            Ok(None) => {
                ev.note(format!(
                    "no handler matches {key} (tried {})",
                    handler_candidates(key, operation_id).join(", ")
                ));
                ev.handler_exists = Some(false);
                None
            }
            Err(reason) => {
                ev.note(format!("handler existence unknown: {reason}"));
                None
            }
        };

        let route_file = match self.inspector.route_for(key) {
            Ok(Some(route)) => {
                let correct = !route.placeholder
                    && handler
                        .as_ref()
                        .is_some_and(|probe| probe.site.symbol == route.handler);
                if route.placeholder {
                    ev.note(format!("route {key} resolves to placeholder handler `{}`", route.handler));
                } else if correct {
                    ev.note(format!("route {key} resolves to `{}`", route.handler));
                } else {
                    ev.note(format!("route {key} resolves to `{}`, not the matched handler", route.handler));
                }
                ev.routing_correct = Some(correct);
                Some(route.site.file)
            }
            Ok(None) => {
                ev.note(format!("no route registered for {key}"));
                ev.routing_correct = Some(false);
                None
            }
            Err(reason) => {
                ev.note(format!("routing unknown: {reason}"));
                None
            }
        };

        let compared_file = handler
            .as_ref()
            .map(|probe| probe.site.file.clone())
            .or(route_file)
            .or_else(|| ev.sites.router.as_ref().map(|site| site.file.clone()));
        ev.recent_regeneration = self.regeneration(&mut ev, compared_file.as_deref());
        ev
    }

    fn regeneration(&self, ev: &mut Evidence, file: Option<&str>) -> Option<bool> {
        let Some(file) = file else {
            ev.note("recent regeneration unknown: no server file shows this endpoint");
            return None;
        };
        let generated = match self.inspector.generation_stamp() {
            Ok(Some(at)) => at,
            Ok(None) => {
                ev.note("recent regeneration unknown: no generation marker available");
                return None;
            }
            Err(reason) => {
                ev.note(format!("recent regeneration unknown: {reason}"));
                return None;
            }
        };
        let edited = match self.inspector.edit_stamp(file) {
            Ok(Some(at)) => at,
            Ok(None) => {
                ev.note(format!("recent regeneration unknown: {file} has no modification time"));
                return None;
            }
            Err(reason) => {
                ev.note(format!("recent regeneration unknown: {reason}"));
                return None;
            }
        };
        let recent = generated > edited;
        ev.note(format!(
            "generation at {generated}, {file} last edited at {edited}: regeneration {}",
            if recent { "is newer" } else { "predates the edit" }
        ));
        Some(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bijux_drift_model::{HttpMethod, LayerPair, MismatchKind};
    use std::collections::BTreeSet;

    struct StampedInspector {
        generated: u64,
        edited: u64,
    }

    impl CodeInspector for StampedInspector {
        fn handler_for(&self, _: &EndpointKey, _: Option<&str>) -> Result<Option<HandlerProbe>, String> {
            Ok(Some(HandlerProbe {
                site: SourceSite::new("src/handlers.rs", Some(3), "create_user"),
                request_struct: None,
                response_struct: None,
            }))
        }

        fn route_for(&self, _: &EndpointKey) -> Result<Option<RouteProbe>, String> {
            Ok(None)
        }

        fn router_site(&self) -> Option<SourceSite> {
            None
        }

        fn generation_stamp(&self) -> Result<Option<u64>, String> {
            Ok(Some(self.generated))
        }

        fn edit_stamp(&self, _: &str) -> Result<Option<u64>, String> {
            Ok(Some(self.edited))
        }
    }

    fn regeneration_for(generated: u64, edited: u64) -> Option<bool> {
        let mismatch = Mismatch::new(
            EndpointKey::new(HttpMethod::Post, "/users"),
            LayerPair::SpecServerRequest,
            MismatchKind::FieldMissing,
            BTreeSet::from(["email".to_string()]),
            BTreeSet::new(),
            BTreeSet::new(),
        )
        .expect("mismatch");
        let collector = EvidenceCollector::new(Arc::new(StampedInspector { generated, edited }));
        collector.collect(&mismatch, None).recent_regeneration
    }

    #[test]
    fn regeneration_must_be_strictly_newer_than_the_edit() {
        assert_eq!(regeneration_for(1_700_000_100, 1_700_000_000), Some(true));
        assert_eq!(regeneration_for(1_700_000_000, 1_700_000_000), Some(false));
        assert_eq!(regeneration_for(1_700_000_000, 1_700_000_100), Some(false));
    }

    #[test]
    fn snake_case_handles_camel_and_separators() {
        assert_eq!(snake_case("getUserById"), "get_user_by_id");
        assert_eq!(snake_case("list-users"), "list_users");
        assert_eq!(snake_case("v2Report"), "v2_report");
    }

    #[test]
    fn candidates_prefer_operation_id() {
        let key = EndpointKey::new(HttpMethod::Get, "/users/{id}/posts");
        assert_eq!(
            handler_candidates(&key, Some("listUserPosts")),
            vec!["list_user_posts".to_string(), "get_users_posts".to_string()]
        );
        assert_eq!(handler_candidates(&key, None), vec!["get_users_posts".to_string()]);
    }
}
