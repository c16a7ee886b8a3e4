//! Bounded, reversible fixes for eligible classified mismatches.

use std::collections::BTreeSet;
use std::sync::Arc;

use bijux_drift_extract::{RouteEntry, ServerIndex, StructEntry};
use bijux_drift_model::{
    Classification, ClassificationKind, ContractModel, Evidence, Fix, FixKind, Layer, LayerPair,
    Mismatch, ModelError, PatchOp, VerificationCheck,
};
use tracing::debug;

use crate::evidence::snake_case;

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "box", "break", "const", "crate", "dyn", "enum", "fn", "impl", "in",
    "let", "loop", "match", "mod", "move", "mut", "pub", "ref", "return", "static", "struct",
    "trait", "type", "use", "where", "while",
];

/// Converts `{id}` path segments to the axum `:id` form.
#[must_use]
pub fn axum_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            seg.strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .map_or_else(|| seg.to_string(), |name| format!(":{name}"))
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn field_ident(wire: &str) -> (String, bool) {
    let snake = snake_case(wire);
    let ident = if RUST_KEYWORDS.contains(&snake.as_str()) {
        format!("r#{snake}")
    } else {
        snake.clone()
    };
    (ident, snake != wire)
}

/// Eligible: a confident true regression or tool artifact whose handler is
/// known to exist.
#[must_use]
pub fn is_eligible(classification: &Classification, evidence: &Evidence) -> bool {
    evidence.handler_exists == Some(true)
        && !classification.is_low_confidence()
        && matches!(
            classification.kind,
            ClassificationKind::TrueRegression | ClassificationKind::ToolArtifact
        )
}

pub struct RemediationPlanner {
    index: Arc<ServerIndex>,
    spec: Arc<ContractModel>,
}

impl RemediationPlanner {
    #[must_use]
    pub fn new(index: Arc<ServerIndex>, spec: Arc<ContractModel>) -> Self {
        Self { index, spec }
    }

    /// The primary fix for one mismatch, or `None` when it is reported only.
    pub fn plan(
        &self,
        mismatch: &Mismatch,
        classification: &Classification,
        evidence: &Evidence,
    ) -> Result<Option<Fix>, ModelError> {
        if !is_eligible(classification, evidence) {
            return Ok(None);
        }
        if mismatch.pair.is_server() && evidence.routing_correct == Some(false) {
            return self.restore_route(mismatch, evidence);
        }
        Ok(None)
    }

    /// Plans every row, then the request-struct alignment that a restored
    /// route would expose. Identical patches are planned once.
    pub fn plan_all(&self, rows: &[(Mismatch, Classification, Evidence)]) -> Result<Vec<Fix>, ModelError> {
        let mut fixes: Vec<Fix> = Vec::new();
        for (mismatch, classification, evidence) in rows {
            let mut planned = Vec::new();
            if let Some(fix) = self.plan(mismatch, classification, evidence)? {
                let restores = fix.kind == FixKind::RestoreRoute;
                planned.push(fix);
                if restores && mismatch.pair == LayerPair::SpecServerRequest {
                    planned.extend(self.align_request_struct(mismatch, evidence)?);
                }
            }
            for fix in planned {
                match fixes.iter_mut().find(|known| known.same_change_as(&fix)) {
                    Some(known) => {
                        for id in fix.mismatch_ids {
                            if !known.mismatch_ids.contains(&id) {
                                known.mismatch_ids.push(id);
                            }
                        }
                    }
                    None => fixes.push(fix),
                }
            }
        }
        debug!(fixes = fixes.len(), "remediation planned");
        Ok(fixes)
    }

    fn restore_route(&self, mismatch: &Mismatch, evidence: &Evidence) -> Result<Option<Fix>, ModelError> {
        let (Some(router), Some(handler)) = (&evidence.sites.router, &evidence.sites.handler) else {
            return Ok(None);
        };
        // router sites carry their source line as the symbol
        let anchor = router.symbol.trim();
        if !anchor.ends_with("new()") {
            debug!(file = %router.file, "router construction is not a bare Router::new() line");
            return Ok(None);
        }
        let mut patch = Vec::new();
        if let Some(route) = self.index.route(&mismatch.endpoint) {
            if !route.placeholder || !removable(route, &router.file) {
                return Ok(None);
            }
            patch.push(PatchOp::RemoveLines {
                anchor: None,
                lines: vec![route.text.clone()],
            });
        }
        let path = self
            .spec
            .get(&mismatch.endpoint)
            .map_or_else(|| mismatch.endpoint.template.clone(), |e| e.endpoint.path.clone());
        let line = format!(
            ".route(\"{}\", {}({}))",
            axum_path(&path),
            mismatch.endpoint.method.as_lower(),
            handler.symbol
        );
        patch.push(PatchOp::InsertAfter {
            anchor: anchor.to_string(),
            lines: vec![line.clone()],
            nested: true,
        });
        let summary = format!("route {} to `{}`", mismatch.endpoint, handler.symbol);
        Fix::propose(
            mismatch.id.clone(),
            FixKind::RestoreRoute,
            &router.file,
            patch,
            vec![VerificationCheck::FileContains {
                path: router.file.clone(),
                needle: line,
            }],
            &summary,
        )
        .map(Some)
    }

    /// Fixes that make the handler's request struct match the spec request
    /// fields once its route is restored: one additive and one destructive
    /// at most.
    fn align_request_struct(&self, mismatch: &Mismatch, evidence: &Evidence) -> Result<Vec<Fix>, ModelError> {
        let Some(site) = &evidence.sites.request_struct else {
            return Ok(Vec::new());
        };
        let Some(entry) = self.index.struct_def(&site.symbol) else {
            return Ok(Vec::new());
        };
        if !entry.text.ends_with('{') {
            return Ok(Vec::new());
        }
        let Some(declared) = self.spec.layer(&mismatch.endpoint, Layer::Spec) else {
            return Ok(Vec::new());
        };
        let observed = match self.index.struct_fields(&entry.name) {
            Ok(set) => set,
            Err(reason) => {
                debug!(name = %entry.name, reason = %reason, "request struct not expandable");
                return Ok(Vec::new());
            }
        };
        let mut out = Vec::new();
        let missing = declared.missing_from(&observed);
        if !missing.is_empty() {
            out.push(add_fields(mismatch, entry, &missing)?);
        }
        let extra = observed.missing_from(declared);
        if let Some(fix) = remove_fields(mismatch, entry, &extra)? {
            out.push(fix);
        }
        Ok(out)
    }
}

fn removable(route: &RouteEntry, router_file: &str) -> bool {
    route.file == router_file && route.text.starts_with(".route(") && route.text.matches('(').count() == 2
}

fn add_fields(
    mismatch: &Mismatch,
    entry: &StructEntry,
    missing: &BTreeSet<String>,
) -> Result<Fix, ModelError> {
    let mut lines = Vec::new();
    let mut checks = Vec::new();
    for wire in missing {
        let (ident, renamed) = field_ident(wire);
        if renamed {
            lines.push(format!("#[serde(rename = \"{wire}\")]"));
        }
        let line = format!("pub {ident}: Option<serde_json::Value>,");
        checks.push(VerificationCheck::FileContains {
            path: entry.file.clone(),
            needle: line.clone(),
        });
        lines.push(line);
    }
    let names = missing.iter().cloned().collect::<Vec<_>>().join(", ");
    Fix::propose(
        mismatch.id.clone(),
        FixKind::AddServerField,
        &entry.file,
        vec![PatchOp::InsertAfter {
            anchor: entry.text.clone(),
            lines,
            nested: true,
        }],
        checks,
        &format!("add optional {names} to `{}`", entry.name),
    )
}

fn remove_fields(
    mismatch: &Mismatch,
    entry: &StructEntry,
    extra: &BTreeSet<String>,
) -> Result<Option<Fix>, ModelError> {
    let mut patch = Vec::new();
    let mut checks = Vec::new();
    let mut names = Vec::new();
    for field in entry.fields.iter().filter(|f| !f.flatten && extra.contains(&f.name)) {
        let mut lines = field.attrs.clone();
        lines.push(field.text.clone());
        patch.push(PatchOp::RemoveLines {
            anchor: Some(entry.text.clone()),
            lines,
        });
        checks.push(VerificationCheck::FileLacks {
            path: entry.file.clone(),
            needle: field.text.clone(),
        });
        names.push(field.name.clone());
    }
    if patch.is_empty() {
        return Ok(None);
    }
    Fix::propose(
        mismatch.id.clone(),
        FixKind::RemoveServerField,
        &entry.file,
        patch,
        checks,
        &format!("remove {} from `{}`", names.join(", "), entry.name),
    )
    .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axum_path_uses_colon_params() {
        assert_eq!(axum_path("/users/{id}/posts/{postId}"), "/users/:id/posts/:postId");
        assert_eq!(axum_path("/health"), "/health");
    }

    #[test]
    fn field_ident_renames_camel_case_and_keywords() {
        assert_eq!(field_ident("email"), ("email".to_string(), false));
        assert_eq!(field_ident("displayName"), ("display_name".to_string(), true));
        assert_eq!(field_ident("type"), ("r#type".to_string(), false));
    }
}
