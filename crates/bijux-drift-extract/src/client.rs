//! Scans UI client sources for HTTP calls and the fields they send or read.

use bijux_drift_model::{ArtifactKind, ContractModel, Endpoint, FieldSet, HttpMethod, Layer};
use regex::Regex;
use tracing::warn;

use crate::scan::{line_of, matching_close, split_top_level, Dialect};
use crate::{ExtractError, SourceFile};

const LOOKBEHIND: usize = 400;

struct Patterns {
    client_call: Regex,
    fetch_call: Regex,
    destructure: Regex,
    option_method: Regex,
    json_body: Regex,
    identifier: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, ExtractError> {
        Ok(Self {
            client_call: Regex::new(
                r#"\b(?:client|api|http|axios)\s*\.\s*(get|post|put|patch|delete|head|options)\s*(?:<[^>()]*>)?\s*\(\s*(?:'([^'\n]*)'|"([^"\n]*)"|`([^`]*)`)"#,
            )?,
            fetch_call: Regex::new(
                r#"\bfetch\s*\(\s*(?:'([^'\n]*)'|"([^"\n]*)"|`([^`]*)`)"#,
            )?,
            destructure: Regex::new(
                r"(?:const|let|var)\s*\{([^{}]*)\}\s*=\s*await\s*(?:\(\s*)?$",
            )?,
            option_method: Regex::new(r#"\bmethod\s*:\s*['"`]([A-Za-z]+)['"`]"#)?,
            json_body: Regex::new(r"\bbody\s*:\s*JSON\s*\.\s*stringify\s*\(\s*")?,
            identifier: Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$")?,
        })
    }
}

/// Drops an absolute origin or a leading `${base}` so only the route remains.
fn route_path(literal: &str) -> Option<String> {
    let mut path = literal.trim();
    if let Some(rest) = path
        .strip_prefix("https://")
        .or_else(|| path.strip_prefix("http://"))
    {
        path = rest.find('/').map_or("", |at| &rest[at..]);
    }
    if path.starts_with("${") {
        let close = path.find('}')?;
        path = &path[close + 1..];
    }
    path.starts_with('/').then(|| path.to_string())
}

fn template_params(literal: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = literal;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = after[..end].trim();
        let name = name.rsplit('.').next().unwrap_or(name).to_string();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
        rest = &after[end + 1..];
    }
    out
}

/// Top-level keys of the object literal whose `{` is at `open`.
fn object_keys(p: &Patterns, text: &str, open: usize) -> Result<(Vec<String>, usize), String> {
    let close = matching_close(text, open, Dialect::Script)
        .ok_or_else(|| "unbalanced object literal".to_string())?;
    let mut keys = Vec::new();
    for entry in split_top_level(&text[open + 1..close], Dialect::Script) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.starts_with("...") {
            return Err(format!("spread `{entry}` hides the field set"));
        }
        let key = if let Some(quote @ ('\'' | '"')) = entry.chars().next() {
            entry[1..]
                .split(quote)
                .next()
                .unwrap_or_default()
                .to_string()
        } else {
            let end = entry
                .find(|c: char| c == ':' || c == '(' || c.is_whitespace())
                .unwrap_or(entry.len());
            entry[..end].to_string()
        };
        if key.is_empty() || !(p.identifier.is_match(&key) || entry.starts_with(&['\'', '"'][..])) {
            return Err(format!("unsupported object entry `{entry}`"));
        }
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Ok((keys, close))
}

fn destructured_keys(list: &str) -> Vec<String> {
    split_top_level(list, Dialect::Script)
        .into_iter()
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && !entry.starts_with("..."))
        .filter_map(|entry| {
            let end = entry.find(|c: char| c == ':' || c == '=').unwrap_or(entry.len());
            let key = entry[..end].trim();
            (!key.is_empty()).then(|| key.to_string())
        })
        .collect()
}

fn skip_ws(text: &str, mut at: usize) -> usize {
    let bytes = text.as_bytes();
    while at < bytes.len() && bytes[at].is_ascii_whitespace() {
        at += 1;
    }
    at
}

#[derive(Debug)]
struct Observation {
    endpoint: Endpoint,
    location: String,
    request: Result<Vec<String>, String>,
    response: Option<Vec<String>>,
}

fn response_keys(p: &Patterns, text: &str, call_start: usize) -> Option<Vec<String>> {
    let mut from = call_start.saturating_sub(LOOKBEHIND);
    while !text.is_char_boundary(from) {
        from += 1;
    }
    p.destructure
        .captures(&text[from..call_start])
        .and_then(|caps| caps.get(1))
        .map(|list| destructured_keys(list.as_str()))
}

fn literal_of<'t>(caps: &regex::Captures<'t>, first: usize) -> Option<regex::Match<'t>> {
    (first..first + 3).find_map(|i| caps.get(i))
}

fn client_calls(p: &Patterns, file: &SourceFile, out: &mut Vec<Observation>) {
    let text = file.text.as_str();
    for caps in p.client_call.captures_iter(text) {
        let (Some(whole), Some(method), Some(literal)) =
            (caps.get(0), caps.get(1), literal_of(&caps, 2))
        else {
            continue;
        };
        let Ok(method) = HttpMethod::parse(method.as_str()) else {
            continue;
        };
        let Some(path) = route_path(literal.as_str()) else {
            continue;
        };
        let mut endpoint = Endpoint::new(method, &path);
        endpoint.params = template_params(&path);
        let after = skip_ws(text, whole.end());
        let takes_body = matches!(method, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch);
        let request = match text.as_bytes().get(after) {
            Some(b',') if takes_body => {
                let arg = skip_ws(text, after + 1);
                match text.as_bytes().get(arg) {
                    Some(b'{') => object_keys(p, text, arg).map(|(keys, _)| keys),
                    Some(b')') => Ok(Vec::new()),
                    _ => Err("request body is not an object literal".to_string()),
                }
            }
            _ => Ok(Vec::new()),
        };
        out.push(Observation {
            endpoint,
            location: format!("{}:{}", file.path, line_of(text, whole.start())),
            request,
            response: response_keys(p, text, whole.start()),
        });
    }
}

fn fetch_calls(p: &Patterns, file: &SourceFile, out: &mut Vec<Observation>) {
    let text = file.text.as_str();
    for caps in p.fetch_call.captures_iter(text) {
        let (Some(whole), Some(literal)) = (caps.get(0), literal_of(&caps, 1)) else {
            continue;
        };
        let Some(path) = route_path(literal.as_str()) else {
            continue;
        };
        let after = skip_ws(text, whole.end());
        let mut method = HttpMethod::Get;
        let mut request = Ok(Vec::new());
        if text.as_bytes().get(after) == Some(&b',') {
            let arg = skip_ws(text, after + 1);
            if text.as_bytes().get(arg) == Some(&b'{') {
                let Some(close) = matching_close(text, arg, Dialect::Script) else {
                    continue;
                };
                let options = &text[arg..=close];
                if let Some(m) = p.option_method.captures(options).and_then(|c| c.get(1)) {
                    match HttpMethod::parse(m.as_str()) {
                        Ok(parsed) => method = parsed,
                        Err(_) => continue,
                    }
                }
                if let Some(body) = p.json_body.find(options) {
                    let open = arg + body.end();
                    request = match text.as_bytes().get(open) {
                        Some(b'{') => object_keys(p, text, open).map(|(keys, _)| keys),
                        _ => Err("JSON.stringify argument is not an object literal".to_string()),
                    };
                }
            }
        }
        let mut endpoint = Endpoint::new(method, &path);
        endpoint.params = template_params(&path);
        out.push(Observation {
            endpoint,
            location: format!("{}:{}", file.path, line_of(text, whole.start())),
            request,
            response: response_keys(p, text, whole.start()),
        });
    }
}

fn field_set(name: &str, keys: &[String]) -> Result<FieldSet, ExtractError> {
    Ok(FieldSet::from_names(name, keys)?)
}

pub fn extract_client_sources(files: &[SourceFile]) -> Result<ContractModel, ExtractError> {
    let patterns = Patterns::compile()?;
    let mut observations = Vec::new();
    for file in files {
        client_calls(&patterns, file, &mut observations);
        fetch_calls(&patterns, file, &mut observations);
    }

    let mut builder = ContractModel::builder(ArtifactKind::Client);
    for obs in observations {
        let label = obs.endpoint.key.to_string();
        match obs.request {
            Ok(keys) => {
                builder.merge_layer(&obs.endpoint, Layer::Client, field_set(&label, &keys)?);
                if let Some(keys) = obs.response {
                    builder.merge_layer(&obs.endpoint, Layer::ResponseClient, field_set(&label, &keys)?);
                }
            }
            Err(reason) => {
                warn!(endpoint = %obs.endpoint.key, location = %obs.location, reason = %reason, "client call extraction failed");
                builder.mark_failed(&obs.endpoint.key, Some(obs.location), &reason);
            }
        }
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bijux_drift_model::EndpointKey;

    fn model(src: &str) -> ContractModel {
        extract_client_sources(&[SourceFile::new("src/api.ts", src)]).expect("model")
    }

    #[test]
    fn client_post_collects_object_keys() {
        let m = model("await client.post('/users', { email, name: form.name, 'x-flag': true });");
        let key = EndpointKey::new(HttpMethod::Post, "/users");
        let layer = m.layer(&key, Layer::Client).expect("client layer");
        assert_eq!(
            layer.names().into_iter().collect::<Vec<_>>(),
            vec!["email", "name", "x-flag"]
        );
    }

    #[test]
    fn empty_body_yields_empty_layer() {
        let m = model("client.post('/x', {})");
        let layer = m
            .layer(&EndpointKey::new(HttpMethod::Post, "/x"), Layer::Client)
            .expect("layer");
        assert!(layer.is_empty());
    }

    #[test]
    fn template_paths_and_destructuring() {
        let m = model(
            "const { id, email } = await api.get(`${BASE}/users/${user.id}`);\n",
        );
        let key = EndpointKey::new(HttpMethod::Get, "/users/{id}");
        let entry = m.get(&key).expect("endpoint");
        assert_eq!(entry.endpoint.params, vec!["id".to_string()]);
        let response = m.layer(&key, Layer::ResponseClient).expect("response");
        assert_eq!(response.names().len(), 2);
    }

    #[test]
    fn fetch_with_json_body() {
        let m = model(
            "fetch('/login', { method: 'POST', headers: {}, body: JSON.stringify({ user, password }) })",
        );
        let layer = m
            .layer(&EndpointKey::new(HttpMethod::Post, "/login"), Layer::Client)
            .expect("layer");
        assert!(layer.contains("password"));
    }

    #[test]
    fn spread_marks_endpoint_failed() {
        let m = model("client.put('/y', { ...rest })\nclient.get('/z')");
        assert!(m.is_failed(&EndpointKey::new(HttpMethod::Put, "/y")));
        assert!(m.contains(&EndpointKey::new(HttpMethod::Get, "/z")));
    }
}
