//! Generic API connector source agent (§4.12).
//!
//! Calls a configured HTTP endpoint and turns the response into zero or
//! more documents. `options` drives the request and the extraction:
//!
//! - `method` (default `"GET"`), `headers` (object), `params` (object,
//!   query string), `body` (arbitrary JSON, sent for non-GET methods)
//! - `data_path`: dotted path into the response body to the list of
//!   items to emit (absent -> the whole body is one document)
//! - `text_field` / `title_field`: per-item field names to pull the
//!   document text / title from (absent -> the item is serialized as
//!   its document text)
//!
//! Authentication: `credentials.kind` is one of `bearer`, `basic`, or
//! `api_key` (with `credentials.header` naming the header to set).

use serde_json::Value;

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, Document};

pub async fn run(config: &AgentConfig) -> Result<Vec<Document>> {
    let method = config
        .options
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_uppercase();

    let client = reqwest::Client::new();
    let method: reqwest::Method = method.parse().map_err(|_| RagError::ConfigInvalid(format!("unsupported http method: {method}")))?;
    let mut request = client.request(method, &config.source_url);

    if let Some(headers) = config.options.get("headers").and_then(|v| v.as_object()) {
        for (key, value) in headers {
            if let Some(v) = value.as_str() {
                request = request.header(key.as_str(), v);
            }
        }
    }
    if let Some(params) = config.options.get("params").and_then(|v| v.as_object()) {
        let pairs: Vec<(String, String)> = params
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        request = request.query(&pairs);
    }
    if let Some(body) = config.options.get("body") {
        request = request.json(body);
    }

    request = apply_auth(request, config)?;

    let response = request.send().await.map_err(|e| RagError::RemoteUnavailable(format!("api request failed: {e}")))?;

    match response.status() {
        s if s == reqwest::StatusCode::TOO_MANY_REQUESTS => {
            return Err(RagError::Transient(format!("api agent rate limited: {}", config.source_url)))
        }
        s if s == reqwest::StatusCode::UNAUTHORIZED || s == reqwest::StatusCode::FORBIDDEN => {
            return Err(RagError::SourceAuth(format!("api agent authentication rejected: {}", config.source_url)))
        }
        s if !s.is_success() => return Err(RagError::RemoteUnavailable(format!("api agent got status {s}"))),
        _ => {}
    }

    let payload: Value = response.json().await.map_err(|e| RagError::Transport(format!("api response was not valid json: {e}")))?;

    let text_field = config.options.get("text_field").and_then(|v| v.as_str());
    let title_field = config.options.get("title_field").and_then(|v| v.as_str());

    let items: Vec<Value> = match config.options.get("data_path").and_then(|v| v.as_str()) {
        Some(path) => get_path(&payload, path).and_then(|v| v.as_array().cloned()).unwrap_or_default(),
        None => vec![payload],
    };

    let mut docs = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let text = match text_field.and_then(|f| get_path(&item, f)) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => serde_json::to_string_pretty(&item).unwrap_or_default(),
        };
        let mut doc = Document::new(format!("api:{}:{idx}", config.agent_id), text);
        if let Some(title) = title_field.and_then(|f| get_path(&item, f)).and_then(|v| v.as_str().map(str::to_string)) {
            doc.metadata.insert("title".to_string(), serde_json::json!(title));
        }
        docs.push(doc);
    }

    if let Some(max) = config.max_items {
        docs.truncate(max);
    }
    Ok(docs)
}

fn apply_auth(mut request: reqwest::RequestBuilder, config: &AgentConfig) -> Result<reqwest::RequestBuilder> {
    let Some(kind) = config.credentials.get("kind") else {
        return Ok(request);
    };
    match kind.as_str() {
        "bearer" => {
            let token = config
                .credentials
                .get("token")
                .ok_or_else(|| RagError::SourceAuth("bearer auth requires credentials.token".to_string()))?;
            request = request.bearer_auth(token);
        }
        "basic" => {
            let username = config
                .credentials
                .get("username")
                .ok_or_else(|| RagError::SourceAuth("basic auth requires credentials.username".to_string()))?;
            let password = config.credentials.get("password").cloned();
            request = request.basic_auth(username, password);
        }
        "api_key" => {
            let key = config
                .credentials
                .get("key")
                .ok_or_else(|| RagError::SourceAuth("api_key auth requires credentials.key".to_string()))?;
            let header = config.credentials.get("header").map(String::as_str).unwrap_or("X-Api-Key");
            request = request.header(header, key);
        }
        other => return Err(RagError::ConfigInvalid(format!("unknown api credentials.kind: {other}"))),
    }
    Ok(request)
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_path_navigates_nested_object() {
        let value = serde_json::json!({"data": {"items": [1, 2, 3]}});
        assert_eq!(get_path(&value, "data.items"), Some(&serde_json::json!([1, 2, 3])));
        assert_eq!(get_path(&value, "data.missing"), None);
    }
}
