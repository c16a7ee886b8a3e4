//! Indexes axum-style server sources: routes, handlers and payload structs.

use std::collections::BTreeMap;

use bijux_drift_model::{
    ArtifactKind, ContractModel, ContractModelBuilder, Endpoint, EndpointKey, FieldSet, FieldSpec,
    HttpMethod, Layer,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scan::{line_of, matching_close, Dialect};
use crate::{ExtractError, SourceFile};

const MAX_FLATTEN_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub method: HttpMethod,
    pub path: String,
    pub handler: String,
    pub file: String,
    pub line: u32,
    /// Trimmed source line holding the registration.
    pub text: String,
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerEntry {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub request: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructField {
    /// Name on the wire, after serde renames.
    pub name: String,
    pub rust_name: String,
    pub rust_type: String,
    pub line: u32,
    pub required: bool,
    pub flatten: bool,
    /// Attribute lines and declaration exactly as written, trimmed.
    pub attrs: Vec<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructEntry {
    pub name: String,
    pub file: String,
    pub line: u32,
    /// Trimmed declaration line, e.g. `pub struct CreateUser {`.
    pub text: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSite {
    pub file: String,
    pub line: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIndex {
    pub routes: BTreeMap<EndpointKey, RouteEntry>,
    pub handlers: BTreeMap<String, HandlerEntry>,
    pub structs: BTreeMap<String, StructEntry>,
    pub routers: Vec<RouterSite>,
}

impl ServerIndex {
    #[must_use]
    pub fn route(&self, key: &EndpointKey) -> Option<&RouteEntry> {
        self.routes.get(key)
    }

    #[must_use]
    pub fn handler(&self, name: &str) -> Option<&HandlerEntry> {
        self.handlers.get(name)
    }

    #[must_use]
    pub fn struct_def(&self, name: &str) -> Option<&StructEntry> {
        self.structs.get(name)
    }

    /// Wire fields of a struct with `#[serde(flatten)]` members expanded.
    pub fn struct_fields(&self, name: &str) -> Result<FieldSet, String> {
        self.collect_fields(name, name, 0)
    }

    fn collect_fields(&self, set_name: &str, name: &str, depth: usize) -> Result<FieldSet, String> {
        if depth > MAX_FLATTEN_DEPTH {
            return Err(format!("flatten chain through `{name}` too deep"));
        }
        let entry = self
            .structs
            .get(name)
            .ok_or_else(|| format!("struct `{name}` not found in server sources"))?;
        let mut set = FieldSet::new(set_name);
        for field in &entry.fields {
            if field.flatten {
                let inner = type_head(strip_option(&field.rust_type).0);
                set.absorb(&self.collect_fields(set_name, inner, depth + 1)?);
                continue;
            }
            let (inner, optional) = strip_option(&field.rust_type);
            let spec = FieldSpec {
                type_name: wire_type(inner),
                required: !optional,
            };
            set.insert(&field.name, spec).map_err(|err| err.to_string())?;
        }
        Ok(set)
    }
}

#[derive(Debug, Clone)]
pub struct ServerExtraction {
    pub model: ContractModel,
    pub index: ServerIndex,
}

struct Patterns {
    route: Regex,
    method_handler: Regex,
    async_fn: Regex,
    json_param: Regex,
    json_return: Regex,
    json_ctor: Regex,
    struct_def: Regex,
    rename_all: Regex,
    rename: Regex,
    skip: Regex,
    flatten: Regex,
    field: Regex,
    router_new: Regex,
    placeholder: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, ExtractError> {
        Ok(Self {
            route: Regex::new(r#"\.route\s*\(\s*"([^"]*)"\s*,"#)?,
            method_handler: Regex::new(
                r"\b(get|post|put|patch|delete|head|options)\s*\(\s*([A-Za-z_][A-Za-z0-9_:]*)\s*\)",
            )?,
            async_fn: Regex::new(
                r"(?m)^[ \t]*(?:pub(?:\([^)]*\))?[ \t]+)?async[ \t]+fn[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*(?:<[^>{]*>)?[ \t]*\(",
            )?,
            json_param: Regex::new(
                r":\s*(?:[A-Za-z_][A-Za-z0-9_]*::)*Json\s*<\s*([A-Za-z_][A-Za-z0-9_:]*)",
            )?,
            json_return: Regex::new(
                r"\bJson\s*<\s*(?:Vec\s*<\s*)?([A-Za-z_][A-Za-z0-9_:]*)",
            )?,
            json_ctor: Regex::new(r"\bJson\s*\(\s*([A-Z][A-Za-z0-9_]*)\s*\{")?,
            struct_def: Regex::new(
                r"(?m)^[ \t]*((?:#\[[^\]]*\]\s*)*)(?:pub(?:\([^)]*\))?[ \t]+)?struct[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*(?:<[^>{]*>)?[ \t]*\{",
            )?,
            rename_all: Regex::new(r#"\brename_all\s*=\s*"([^"]+)""#)?,
            rename: Regex::new(r#"\brename\s*=\s*"([^"]+)""#)?,
            skip: Regex::new(r"\bskip\s*[,)]")?,
            flatten: Regex::new(r"\bflatten\b")?,
            field: Regex::new(
                r"^(?:pub(?:\([^)]*\))?\s+)?(?:r#)?([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.+?)\s*,?$",
            )?,
            router_new: Regex::new(r"\bRouter\s*(?:::\s*<[^>]*>\s*)?::\s*new\s*\(\s*\)")?,
            placeholder: Regex::new(
                r"(?i)(?:^|_)(?:not_implemented|unimplemented|placeholder|fallback|todo|stub)(?:_|$)",
            )?,
        })
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

fn strip_option(ty: &str) -> (&str, bool) {
    let ty = ty.trim();
    let head = ty.split('<').next().unwrap_or(ty).trim();
    if last_segment(head) == "Option" {
        if let (Some(open), Some(close)) = (ty.find('<'), ty.rfind('>')) {
            if open < close {
                return (ty[open + 1..close].trim(), true);
            }
        }
    }
    (ty, false)
}

fn type_head(ty: &str) -> &str {
    last_segment(ty.split('<').next().unwrap_or(ty).trim())
}

/// Maps a Rust field type onto the primitive vocabulary used by the spec
/// extractor. Named or dynamic types stay untyped.
fn wire_type(ty: &str) -> Option<String> {
    let ty = ty.trim().trim_start_matches('&');
    if ty.starts_with('[') {
        return Some("array".to_string());
    }
    let name = match type_head(ty) {
        "String" | "str" | "char" | "Uuid" | "DateTime" | "NaiveDate" | "NaiveDateTime" => "string",
        "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64"
        | "u128" | "usize" => "integer",
        "f32" | "f64" => "number",
        "bool" => "boolean",
        "Vec" | "VecDeque" | "HashSet" | "BTreeSet" => "array",
        _ => return None,
    };
    Some(name.to_string())
}

fn is_dynamic(ty: &str) -> bool {
    matches!(type_head(ty), "Value" | "HashMap" | "BTreeMap" | "Map")
}

fn capitalize(segment: &str) -> String {
    let mut chars = segment.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

fn apply_rename_all(rule: &str, field: &str) -> String {
    let parts = field.split('_').filter(|p| !p.is_empty()).collect::<Vec<_>>();
    match rule {
        "camelCase" => parts
            .iter()
            .enumerate()
            .map(|(i, p)| if i == 0 { (*p).to_string() } else { capitalize(p) })
            .collect(),
        "PascalCase" => parts.iter().map(|p| capitalize(p)).collect(),
        "kebab-case" => parts.join("-"),
        "SCREAMING_SNAKE_CASE" | "UPPERCASE" => field.to_ascii_uppercase(),
        "SCREAMING-KEBAB-CASE" => parts.join("-").to_ascii_uppercase(),
        "lowercase" => field.to_ascii_lowercase(),
        _ => field.to_string(),
    }
}

fn index_structs(p: &Patterns, file: &SourceFile, index: &mut ServerIndex) {
    let text = file.text.as_str();
    for caps in p.struct_def.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let attrs = caps.get(1).map_or("", |m| m.as_str());
        let rename_all = p
            .rename_all
            .captures(attrs)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let open = whole.end() - 1;
        let Some(close) = matching_close(text, open, Dialect::Rust) else {
            continue;
        };
        let body = &text[open + 1..close];
        let body_line = line_of(text, open);
        let fields = parse_fields(p, body, body_line, rename_all.as_deref());
        let name = name.as_str().to_string();
        if index.structs.contains_key(&name) {
            debug!(name = %name, file = %file.path, "duplicate struct name; keeping first");
            continue;
        }
        let decl_line = line_of(text, name_offset(text, whole.start(), &name));
        index.structs.insert(
            name.clone(),
            StructEntry {
                name,
                file: file.path.clone(),
                line: decl_line,
                text: source_line(text, decl_line),
                fields,
            },
        );
    }
}

fn source_line(text: &str, line: u32) -> String {
    text.lines()
        .nth(line.saturating_sub(1) as usize)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn name_offset(text: &str, from: usize, name: &str) -> usize {
    text[from..]
        .find(&format!("struct {name}"))
        .map_or(from, |at| from + at)
}

fn parse_fields(p: &Patterns, body: &str, body_line: u32, rename_all: Option<&str>) -> Vec<StructField> {
    let mut out = Vec::new();
    let mut pending_attrs: Vec<String> = Vec::new();
    let mut carried = String::new();
    let mut carried_line = 0u32;
    for (offset, raw) in body.lines().enumerate() {
        let line_no = body_line + u32::try_from(offset).unwrap_or(0);
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if line.starts_with("#[") {
            pending_attrs.push(line.to_string());
            continue;
        }
        if carried.is_empty() {
            carried_line = line_no;
        } else {
            carried.push(' ');
        }
        carried.push_str(line);
        if carried.matches('<').count() > carried.matches('>').count() {
            continue;
        }
        let statement = std::mem::take(&mut carried);
        let attr_lines = std::mem::take(&mut pending_attrs);
        let attrs = attr_lines.concat();
        let Some(caps) = p.field.captures(&statement) else {
            continue;
        };
        let (Some(rust_name), Some(rust_type)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if p.skip.is_match(&attrs) {
            continue;
        }
        let rust_name = rust_name.as_str().to_string();
        let name = p
            .rename
            .captures(&attrs)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| {
                rename_all.map_or_else(|| rust_name.clone(), |rule| apply_rename_all(rule, &rust_name))
            });
        let rust_type = rust_type.as_str().trim_end_matches(',').trim().to_string();
        let required = !strip_option(&rust_type).1 && !attrs.contains("default");
        out.push(StructField {
            name,
            rust_name,
            rust_type,
            line: carried_line,
            required,
            flatten: p.flatten.is_match(&attrs),
            attrs: attr_lines,
            text: statement.clone(),
        });
    }
    out
}

fn index_handlers(p: &Patterns, file: &SourceFile, index: &mut ServerIndex) {
    let text = file.text.as_str();
    for caps in p.async_fn.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let open = whole.end() - 1;
        let Some(close) = matching_close(text, open, Dialect::Rust) else {
            continue;
        };
        let params = &text[open + 1..close];
        let Some(body_rel) = text[close..].find('{') else {
            continue;
        };
        let ret = &text[close + 1..close + body_rel];
        let body = matching_close(text, close + body_rel, Dialect::Rust)
            .map_or("", |end| &text[close + body_rel..=end]);

        let request = p
            .json_param
            .captures(params)
            .and_then(|c| c.get(1))
            .map(|m| last_segment(m.as_str()).to_string());
        let response = p
            .json_return
            .captures(ret)
            .and_then(|c| c.get(1))
            .map(|m| last_segment(m.as_str()).to_string())
            .or_else(|| {
                p.json_ctor
                    .captures(body)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            });
        let name = name.as_str().to_string();
        if index.handlers.contains_key(&name) {
            debug!(name = %name, file = %file.path, "duplicate handler name; keeping first");
            continue;
        }
        index.handlers.insert(
            name.clone(),
            HandlerEntry {
                name,
                file: file.path.clone(),
                line: line_of(text, whole.start() + (whole.as_str().len() - whole.as_str().trim_start().len())),
                request,
                response,
            },
        );
    }
}

fn index_routes(p: &Patterns, file: &SourceFile, index: &mut ServerIndex) {
    let text = file.text.as_str();
    for site in p.router_new.find_iter(text) {
        let line = line_of(text, site.start());
        index.routers.push(RouterSite {
            file: file.path.clone(),
            line,
            text: source_line(text, line),
        });
    }
    for caps in p.route.captures_iter(text) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(paren) = whole.as_str().find('(').map(|at| whole.start() + at) else {
            continue;
        };
        let Some(close) = matching_close(text, paren, Dialect::Rust) else {
            continue;
        };
        let expr = &text[whole.end()..close];
        let line = line_of(text, whole.start());
        for call in p.method_handler.captures_iter(expr) {
            let (Some(method), Some(handler)) = (call.get(1), call.get(2)) else {
                continue;
            };
            let Ok(method) = HttpMethod::parse(method.as_str()) else {
                continue;
            };
            let handler = last_segment(handler.as_str()).to_string();
            let key = EndpointKey::new(method, path.as_str());
            if index.routes.contains_key(&key) {
                warn!(endpoint = %key, file = %file.path, line, "route registered twice; keeping first");
                continue;
            }
            index.routes.insert(
                key,
                RouteEntry {
                    method,
                    path: path.as_str().to_string(),
                    placeholder: p.placeholder.is_match(&handler),
                    handler,
                    file: file.path.clone(),
                    line,
                    text: source_line(text, line),
                },
            );
        }
    }
}

fn path_params(path: &str) -> Vec<String> {
    path.split('/')
        .filter_map(|seg| {
            seg.strip_prefix(':')
                .or_else(|| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
                .map(|name| name.trim_start_matches('*').to_string())
        })
        .collect()
}

fn payload_layer(index: &ServerIndex, ty: Option<&String>, fallback: &str) -> Result<Option<FieldSet>, String> {
    match ty {
        None => Ok(Some(FieldSet::new(fallback))),
        Some(ty) if is_dynamic(ty) => Ok(None),
        Some(ty) => index.struct_fields(ty).map(Some),
    }
}

fn emit_route(index: &ServerIndex, route: &RouteEntry, builder: &mut ContractModelBuilder) {
    let mut endpoint = Endpoint::new(route.method, &route.path);
    endpoint.params = path_params(&route.path);
    let key = endpoint.key.clone();
    let location = format!("{}:{}", route.file, route.line);
    let fail = |builder: &mut ContractModelBuilder, reason: String| {
        warn!(endpoint = %key, location = %location, reason = %reason, "server endpoint extraction failed");
        builder.mark_failed(&key, Some(location.clone()), &reason);
    };
    let Some(handler) = index.handler(&route.handler) else {
        fail(builder, format!("handler `{}` not found in server sources", route.handler));
        return;
    };
    endpoint.request_schema = handler.request.clone();
    endpoint.response_schema = handler.response.clone();
    let request = payload_layer(index, handler.request.as_ref(), &format!("{}_request", handler.name));
    let response = payload_layer(index, handler.response.as_ref(), &format!("{}_response", handler.name));
    match (request, response) {
        (Err(reason), _) | (_, Err(reason)) => fail(builder, reason),
        (Ok(None), Ok(None)) => fail(builder, "handler payloads are dynamic".to_string()),
        (Ok(request), Ok(response)) => {
            if let Some(fields) = request {
                builder.set_layer(&endpoint, Layer::Server, fields);
            }
            if let Some(fields) = response {
                builder.set_layer(&endpoint, Layer::ResponseServer, fields);
            }
        }
    }
}

pub fn extract_server_sources(files: &[SourceFile]) -> Result<ServerExtraction, ExtractError> {
    let patterns = Patterns::compile()?;
    let mut index = ServerIndex::default();
    for file in files {
        index_structs(&patterns, file, &mut index);
        index_handlers(&patterns, file, &mut index);
        index_routes(&patterns, file, &mut index);
    }

    let mut builder = ContractModel::builder(ArtifactKind::Server);
    for route in index.routes.values() {
        if route.placeholder {
            debug!(endpoint = %route.path, handler = %route.handler, "placeholder route contributes no fields");
            continue;
        }
        emit_route(&index, route, &mut builder);
    }
    Ok(ServerExtraction {
        model: builder.build()?,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTER: &str = r#"
use axum::{routing::{get, post}, Json, Router};

pub fn app() -> Router {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/:id", get(handlers::get_user))
        .route("/reports", get(not_implemented))
}
"#;

    const HANDLERS: &str = r#"
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUser {
    pub email: String,
    pub display_name: Option<String>,
    #[serde(rename = "age_years")]
    pub age: u32,
    #[serde(skip)]
    pub internal: bool,
    #[serde(flatten)]
    pub extra: Audit,
}

pub struct Audit {
    pub source: String,
}

#[derive(Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

pub async fn create_user(Json(body): Json<CreateUser>) -> Result<Json<User>, StatusCode> {
    todo!()
}

pub async fn list_users() -> Json<Vec<User>> {
    todo!()
}

pub async fn get_user(Path(id): Path<String>) -> impl IntoResponse {
    Json(User { id, email: String::new() })
}
"#;

    fn extraction() -> ServerExtraction {
        extract_server_sources(&[
            SourceFile::new("src/handlers.rs", HANDLERS),
            SourceFile::new("src/router.rs", ROUTER),
        ])
        .expect("extraction")
    }

    #[test]
    fn request_struct_fields_honor_serde_attributes() {
        let ex = extraction();
        let key = EndpointKey::new(HttpMethod::Post, "/users");
        let layer = ex.model.layer(&key, Layer::Server).expect("server layer");
        assert_eq!(
            layer.names().into_iter().collect::<Vec<_>>(),
            vec!["age_years", "displayName", "email", "source"]
        );
        assert!(!layer.get("displayName").expect("field").required);
        assert_eq!(layer.get("age_years").expect("age").type_name.as_deref(), Some("integer"));
    }

    #[test]
    fn responses_come_from_return_type_or_body() {
        let ex = extraction();
        let list = EndpointKey::new(HttpMethod::Get, "/users");
        assert!(ex.model.layer(&list, Layer::ResponseServer).expect("list").contains("id"));
        let get = EndpointKey::new(HttpMethod::Get, "/users/{id}");
        assert!(ex.model.layer(&get, Layer::ResponseServer).expect("get").contains("email"));
        assert_eq!(ex.model.get(&get).expect("get").endpoint.params, vec!["id".to_string()]);
    }

    #[test]
    fn placeholder_routes_are_indexed_without_fields() {
        let ex = extraction();
        let key = EndpointKey::new(HttpMethod::Get, "/reports");
        assert!(ex.index.route(&key).expect("route").placeholder);
        assert!(!ex.model.contains(&key));
    }

    #[test]
    fn index_records_router_and_handler_sites() {
        let ex = extraction();
        assert_eq!(ex.index.routers.len(), 1);
        assert_eq!(ex.index.routers[0].text, "Router::new()");
        let handler = ex.index.handler("create_user").expect("handler");
        assert_eq!(handler.request.as_deref(), Some("CreateUser"));
        assert_eq!(handler.response.as_deref(), Some("User"));
        assert_eq!(ex.index.struct_def("CreateUser").expect("struct").file, "src/handlers.rs");
    }

    #[test]
    fn missing_handler_marks_route_failed() {
        let ex = extract_server_sources(&[SourceFile::new(
            "src/main.rs",
            "fn app() { Router::new().route(\"/x\", get(ghost)); }",
        )])
        .expect("extraction");
        assert!(ex.model.is_failed(&EndpointKey::new(HttpMethod::Get, "/x")));
    }

    #[test]
    fn rename_all_rules() {
        assert_eq!(apply_rename_all("camelCase", "display_name"), "displayName");
        assert_eq!(apply_rename_all("kebab-case", "display_name"), "display-name");
        assert_eq!(apply_rename_all("PascalCase", "display_name"), "DisplayName");
    }
}
