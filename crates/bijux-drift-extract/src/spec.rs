//! OpenAPI 3.x extraction (YAML or JSON text).

use bijux_drift_model::{
    ArtifactKind, ContractModel, ContractModelBuilder, Endpoint, FieldSet, FieldSpec, HttpMethod,
    Layer,
};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::ExtractError;

const MAX_REF_DEPTH: usize = 16;
const JSON_MEDIA_TYPE: &str = "application/json";

fn key_text(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sorted_entries(map: &Mapping) -> Vec<(String, &Value)> {
    let mut out = map
        .iter()
        .filter_map(|(k, v)| key_text(k).map(|k| (k, v)))
        .collect::<Vec<_>>();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value.as_mapping().and_then(|m| m.get(name))
}

/// Follows a local `#/...` pointer inside the document.
fn resolve_pointer<'a>(doc: &'a Value, reference: &str) -> Result<&'a Value, String> {
    let pointer = reference
        .strip_prefix("#/")
        .ok_or_else(|| format!("unsupported non-local $ref `{reference}`"))?;
    let mut node = doc;
    for segment in pointer.split('/') {
        let decoded = segment.replace("~1", "/").replace("~0", "~");
        node = field(node, &decoded).ok_or_else(|| format!("unresolvable $ref `{reference}`"))?;
    }
    Ok(node)
}

fn deref<'a>(doc: &'a Value, mut node: &'a Value) -> Result<&'a Value, String> {
    for _ in 0..MAX_REF_DEPTH {
        match field(node, "$ref").and_then(Value::as_str) {
            Some(reference) => node = resolve_pointer(doc, reference)?,
            None => return Ok(node),
        }
    }
    Err("$ref chain too deep".to_string())
}

fn ref_name(node: &Value) -> Option<String> {
    field(node, "$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.rsplit('/').next())
        .map(str::to_string)
}

/// Primitive type vocabulary shared with the server extractor; named and
/// composite schemas stay untyped.
fn property_type(doc: &Value, prop: &Value) -> Result<Option<String>, String> {
    let resolved = deref(doc, prop)?;
    Ok(match field(resolved, "type").and_then(Value::as_str) {
        Some(t @ ("string" | "integer" | "number" | "boolean" | "array")) => Some(t.to_string()),
        _ => None,
    })
}

fn schema_fields(doc: &Value, schema: &Value, name: &str, depth: usize) -> Result<FieldSet, String> {
    if depth > MAX_REF_DEPTH {
        return Err("schema nesting too deep".to_string());
    }
    let set_name = ref_name(schema).unwrap_or_else(|| name.to_string());
    let schema = deref(doc, schema)?;
    if field(schema, "type").and_then(Value::as_str) == Some("array") {
        return match field(schema, "items") {
            Some(items) => schema_fields(doc, items, &set_name, depth + 1),
            None => Ok(FieldSet::new(&set_name)),
        };
    }
    let mut set = FieldSet::new(&set_name);
    if let Some(parts) = field(schema, "allOf").and_then(Value::as_sequence) {
        for part in parts {
            set.absorb(&schema_fields(doc, part, &set_name, depth + 1)?);
        }
    }
    let required = field(schema, "required")
        .and_then(Value::as_sequence)
        .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    if let Some(props) = field(schema, "properties") {
        let props = props
            .as_mapping()
            .ok_or_else(|| format!("`properties` of {set_name} is not a mapping"))?;
        let mut own = FieldSet::new(&set_name);
        for (prop_name, prop) in sorted_entries(props) {
            let spec = FieldSpec {
                type_name: property_type(doc, prop)?,
                required: required.contains(&prop_name.as_str()),
            };
            own.insert(&prop_name, spec).map_err(|err| err.to_string())?;
        }
        set.absorb(&own);
    }
    Ok(set)
}

fn json_schema<'a>(doc: &'a Value, holder: &'a Value) -> Result<Option<&'a Value>, String> {
    let holder = deref(doc, holder)?;
    Ok(field(holder, "content")
        .and_then(|content| field(content, JSON_MEDIA_TYPE))
        .and_then(|media| field(media, "schema")))
}

fn parameter_names(doc: &Value, params: Option<&Value>, out: &mut Vec<String>) -> Result<(), String> {
    let Some(params) = params else {
        return Ok(());
    };
    let items = params
        .as_sequence()
        .ok_or_else(|| "`parameters` is not a list".to_string())?;
    for item in items {
        let param = deref(doc, item)?;
        let location = field(param, "in").and_then(Value::as_str).unwrap_or_default();
        if !matches!(location, "path" | "query") {
            continue;
        }
        let name = field(param, "name")
            .and_then(Value::as_str)
            .ok_or_else(|| "parameter without a name".to_string())?;
        if !out.iter().any(|existing| existing == name) {
            out.push(name.to_string());
        }
    }
    Ok(())
}

struct Operation {
    endpoint: Endpoint,
    request: FieldSet,
    response: FieldSet,
}

fn read_operation(
    doc: &Value,
    path: &str,
    method: HttpMethod,
    path_params: Option<&Value>,
    op: &Value,
) -> Result<Operation, String> {
    if op.as_mapping().is_none() {
        return Err("operation is not a mapping".to_string());
    }
    let mut endpoint = Endpoint::new(method, path);
    endpoint.operation_id = field(op, "operationId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let label = endpoint
        .operation_id
        .clone()
        .unwrap_or_else(|| format!("{}_{}", method.as_lower(), endpoint.key.template));

    let mut params = Vec::new();
    parameter_names(doc, path_params, &mut params)?;
    parameter_names(doc, field(op, "parameters"), &mut params)?;
    endpoint.params = params;

    let request = match field(op, "requestBody") {
        Some(body) => match json_schema(doc, body)? {
            Some(schema) => {
                endpoint.request_schema = ref_name(schema);
                schema_fields(doc, schema, &format!("{label}_request"), 0)?
            }
            None => FieldSet::new(&format!("{label}_request")),
        },
        None => FieldSet::new(&format!("{label}_request")),
    };

    let mut response = FieldSet::new(&format!("{label}_response"));
    if let Some(responses) = field(op, "responses").and_then(Value::as_mapping) {
        let success = sorted_entries(responses)
            .into_iter()
            .find(|(code, _)| code.starts_with('2'));
        if let Some((_, resp)) = success {
            if let Some(schema) = json_schema(doc, resp)? {
                endpoint.response_schema = ref_name(schema).or_else(|| {
                    field(schema, "items").and_then(ref_name)
                });
                response = schema_fields(doc, schema, &format!("{label}_response"), 0)?;
            }
        }
    }
    Ok(Operation {
        endpoint,
        request,
        response,
    })
}

fn record_failure(builder: &mut ContractModelBuilder, endpoint: &Endpoint, location: String, reason: &str) {
    warn!(endpoint = %endpoint.key, location = %location, reason, "spec endpoint extraction failed");
    builder.mark_failed(&endpoint.key, Some(location), reason);
}

pub fn extract_spec_text(text: &str) -> Result<ContractModel, ExtractError> {
    let doc: Value = serde_yaml::from_str(text)
        .map_err(|err| ExtractError::parse(ArtifactKind::Spec, err.to_string()))?;
    let paths = field(&doc, "paths")
        .and_then(Value::as_mapping)
        .ok_or_else(|| ExtractError::parse(ArtifactKind::Spec, "document has no `paths` mapping"))?;

    let mut builder = ContractModel::builder(ArtifactKind::Spec);
    for (path, item) in sorted_entries(paths) {
        let Some(item_map) = item.as_mapping() else {
            warn!(path = %path, "spec path item is not a mapping");
            continue;
        };
        let path_params = item_map.get("parameters");
        for (method_key, op) in sorted_entries(item_map) {
            let Ok(method) = HttpMethod::parse(&method_key) else {
                continue;
            };
            let location = format!("paths.{path}.{method_key}");
            match read_operation(&doc, &path, method, path_params, op) {
                Ok(operation) => {
                    builder.set_layer(&operation.endpoint, Layer::Spec, operation.request);
                    builder.set_layer(&operation.endpoint, Layer::ResponseSpec, operation.response);
                }
                Err(reason) => {
                    record_failure(&mut builder, &Endpoint::new(method, &path), location, &reason);
                }
            }
        }
    }
    Ok(builder.build()?)
}
