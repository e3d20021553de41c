//! Prompt renderer (C10).
//!
//! A hand-rolled Jinja-style templating engine: `{{ path.to.var }}` and
//! `{{ path|filter|filter(arg, arg) }}` placeholders over a flat
//! parameter map. Deliberately not a full templating language — no
//! control flow, no includes — just variable interpolation plus the
//! closed filter set the RAG orchestrator and ingestion prompts need.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RagError, Result};
use crate::models::{PromptTemplate, PromptTemplateType};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap())
}

/// One message in a rendered chat template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

fn stringify_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(_) | Value::Bool(_) => v.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn get_var(params: &HashMap<String, Value>, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = params.get(first)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\''))) {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn parse_filter(segment: &str) -> (String, Vec<String>) {
    let segment = segment.trim();
    if let Some(open) = segment.find('(') {
        if segment.ends_with(')') {
            let name = segment[..open].trim().to_string();
            let args_str = &segment[open + 1..segment.len() - 1];
            let args = if args_str.trim().is_empty() {
                Vec::new()
            } else {
                args_str.split(',').map(unquote).collect()
            };
            return (name, args);
        }
    }
    (segment.to_string(), Vec::new())
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// The closed filter set from §4.10. Unknown filter names pass the
/// value through unchanged rather than erroring, so a typo in a filter
/// chain degrades to an unfiltered value instead of failing the render.
fn apply_filter(value: Value, name: &str, args: &[String]) -> Value {
    match name {
        "strip" => Value::String(stringify_value(&value).trim().to_string()),
        "upper" => Value::String(stringify_value(&value).to_uppercase()),
        "lower" => Value::String(stringify_value(&value).to_lowercase()),
        "title" => Value::String(title_case(&stringify_value(&value))),
        "capitalize" => Value::String(capitalize(&stringify_value(&value))),
        "join" => {
            let sep = args.first().cloned().unwrap_or_else(|| ", ".to_string());
            match &value {
                Value::Array(items) => Value::String(items.iter().map(stringify_value).collect::<Vec<_>>().join(&sep)),
                other => Value::String(stringify_value(other)),
            }
        }
        "first" => match &value {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            Value::String(s) => Value::String(s.chars().next().map(|c| c.to_string()).unwrap_or_default()),
            other => other.clone(),
        },
        "last" => match &value {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            Value::String(s) => Value::String(s.chars().last().map(|c| c.to_string()).unwrap_or_default()),
            other => other.clone(),
        },
        "truncate" => {
            let n: usize = args.first().and_then(|s| s.parse().ok()).unwrap_or(50);
            let suffix = args.get(1).cloned().unwrap_or_else(|| "...".to_string());
            let s = stringify_value(&value);
            if s.chars().count() > n {
                Value::String(format!("{}{suffix}", s.chars().take(n).collect::<String>()))
            } else {
                Value::String(s)
            }
        }
        "format_json" => Value::String(serde_json::to_string(&value).unwrap_or_default()),
        "bullet_list" => {
            let bullet = args.first().cloned().unwrap_or_else(|| "-".to_string());
            match &value {
                Value::Array(items) => {
                    Value::String(items.iter().map(|i| format!("{bullet} {}", stringify_value(i))).collect::<Vec<_>>().join("\n"))
                }
                other => Value::String(stringify_value(other)),
            }
        }
        _ => value,
    }
}

fn render_expr(expr: &str, params: &HashMap<String, Value>) -> std::result::Result<String, String> {
    let mut parts = expr.split('|');
    let var_path = parts.next().unwrap_or("").trim();
    let value = get_var(params, var_path).ok_or_else(|| var_path.to_string())?;
    let mut current = value;
    for filter_seg in parts {
        let (name, args) = parse_filter(filter_seg);
        current = apply_filter(current, &name, &args);
    }
    Ok(stringify_value(&current))
}

/// Render `template` against `params`. Any referenced variable missing
/// from `params` fails with `TemplateInvalid` naming the variable.
pub fn render(template: &str, params: &HashMap<String, Value>) -> Result<String> {
    let re = placeholder_re();
    let mut out = String::with_capacity(template.len());
    let mut last_end = 0;
    for caps in re.captures_iter(template) {
        let m = caps.get(0).unwrap();
        out.push_str(&template[last_end..m.start()]);
        let expr = caps.get(1).unwrap().as_str();
        let rendered = render_expr(expr, params).map_err(|missing| RagError::TemplateInvalid(format!("undefaulted variable '{missing}'")))?;
        out.push_str(&rendered);
        last_end = m.end();
    }
    out.push_str(&template[last_end..]);
    Ok(out)
}

fn extract_variable_names(template: &str) -> HashSet<String> {
    placeholder_re()
        .captures_iter(template)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().split('|').next().unwrap_or("").trim().split('.').next().unwrap_or("").to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn validate_chat_json(rendered: &str, template_id: &str) -> Result<Vec<ChatMessage>> {
    let messages: Vec<ChatMessage> = serde_json::from_str(rendered)
        .map_err(|e| RagError::TemplateInvalid(format!("chat template '{template_id}' did not render valid [{{role,content}}] JSON: {e}")))?;
    Ok(messages)
}

/// Validate a template at create/update time (§4.10): every referenced
/// variable must be covered by `default_parameters`, and the template
/// must actually render with just those defaults; chat templates must
/// additionally render to valid `[{role, content}, ...]` JSON.
pub fn validate_template(tpl: &PromptTemplate) -> Result<()> {
    let mut templates = vec![("default", tpl.template.as_str())];
    for (model_id, t) in &tpl.model_specific_versions {
        templates.push((model_id.as_str(), t.as_str()));
    }

    for (label, text) in templates {
        for var in extract_variable_names(text) {
            if !tpl.default_parameters.contains_key(&var) {
                return Err(RagError::TemplateInvalid(format!(
                    "template '{}' ({label}) references undefaulted variable '{var}'",
                    tpl.id
                )));
            }
        }
        let rendered = render(text, &tpl.default_parameters)?;
        if tpl.template_type == PromptTemplateType::Chat {
            validate_chat_json(&rendered, &tpl.id)?;
        }
    }
    Ok(())
}

fn merged_params(tpl: &PromptTemplate, params: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut merged = tpl.default_parameters.clone();
    for (k, v) in params {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Render `tpl` as plain text, selecting the per-model override by
/// exact `model_id` match if present.
pub fn render_text(tpl: &PromptTemplate, model_id: Option<&str>, params: &HashMap<String, Value>) -> Result<String> {
    let template = tpl.template_for(model_id);
    render(template, &merged_params(tpl, params))
}

/// Render `tpl` (which must be a `Chat` template) into a validated list
/// of chat messages.
pub fn render_chat(tpl: &PromptTemplate, model_id: Option<&str>, params: &HashMap<String, Value>) -> Result<Vec<ChatMessage>> {
    let rendered = render_text(tpl, model_id, params)?;
    validate_chat_json(&rendered, &tpl.id)
}

/// Load and validate every `*.json` template under `path` (§6, C10/C11
/// configuration). Each file holds one [`PromptTemplate`].
pub fn load_templates_from_dir(path: &std::path::Path) -> Result<Vec<PromptTemplate>> {
    let entries = std::fs::read_dir(path).map_err(|e| RagError::ConfigInvalid(format!("failed to read templates_path {}: {e}", path.display())))?;
    let mut templates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RagError::ConfigInvalid(format!("failed to read template entry: {e}")))?;
        let entry_path = entry.path();
        if entry_path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = std::fs::read_to_string(&entry_path).map_err(|e| RagError::ConfigInvalid(format!("failed to read {}: {e}", entry_path.display())))?;
        let tpl: PromptTemplate = serde_json::from_str(&content).map_err(|e| RagError::TemplateInvalid(format!("invalid template file {}: {e}", entry_path.display())))?;
        validate_template(&tpl)?;
        templates.push(tpl);
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn renders_simple_variable() {
        let out = render("Hello {{ name }}!", &params(&[("name", Value::String("Ada".into()))])).unwrap();
        assert_eq!(out, "Hello Ada!");
    }

    #[test]
    fn missing_variable_fails() {
        let err = render("Hi {{ missing }}", &params(&[])).unwrap_err();
        assert_eq!(err.code(), "template_invalid");
    }

    #[test]
    fn filter_chain_applies_in_order() {
        let out = render("{{ name|strip|upper }}", &params(&[("name", Value::String("  ada  ".into()))])).unwrap();
        assert_eq!(out, "ADA");
    }

    #[test]
    fn join_filter_over_array() {
        let out = render(
            "{{ tags|join(', ') }}",
            &params(&[("tags", serde_json::json!(["rust", "rag"]))]),
        )
        .unwrap();
        assert_eq!(out, "rust, rag");
    }

    #[test]
    fn truncate_filter_adds_suffix() {
        let out = render("{{ text|truncate(5, '...') }}", &params(&[("text", Value::String("hello world".into()))])).unwrap();
        assert_eq!(out, "hello...");
    }

    #[test]
    fn bullet_list_filter() {
        let out = render("{{ items|bullet_list('*') }}", &params(&[("items", serde_json::json!(["a", "b"]))])).unwrap();
        assert_eq!(out, "* a\n* b");
    }

    #[test]
    fn dot_path_navigates_nested_object() {
        let out = render("{{ user.name }}", &params(&[("user", serde_json::json!({"name": "grace"}))])).unwrap();
        assert_eq!(out, "grace");
    }

    #[test]
    fn validate_template_rejects_undefaulted_variable() {
        let tpl = PromptTemplate {
            id: "t1".into(),
            template_type: PromptTemplateType::Instruction,
            template: "{{ missing }}".into(),
            default_parameters: HashMap::new(),
            model_specific_versions: HashMap::new(),
        };
        assert!(validate_template(&tpl).is_err());
    }

    #[test]
    fn validate_template_accepts_covered_variable() {
        let tpl = PromptTemplate {
            id: "t1".into(),
            template_type: PromptTemplateType::Instruction,
            template: "{{ name }}".into(),
            default_parameters: params(&[("name", Value::String("x".into()))]),
            model_specific_versions: HashMap::new(),
        };
        assert!(validate_template(&tpl).is_ok());
    }

    #[test]
    fn chat_template_validates_message_shape() {
        let tpl = PromptTemplate {
            id: "chat1".into(),
            template_type: PromptTemplateType::Chat,
            template: r#"[{"role": "system", "content": "{{ system }}"}, {"role": "user", "content": "{{ question }}"}]"#.into(),
            default_parameters: params(&[("system", Value::String("s".into())), ("question", Value::String("q".into()))]),
            model_specific_versions: HashMap::new(),
        };
        assert!(validate_template(&tpl).is_ok());
        let messages = render_chat(&tpl, None, &params(&[("question", Value::String("what time is it?".into()))])).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "what time is it?");
    }

    #[test]
    fn chat_template_rejects_non_json_render() {
        let tpl = PromptTemplate {
            id: "chat2".into(),
            template_type: PromptTemplateType::Chat,
            template: "not json {{ x }}".into(),
            default_parameters: params(&[("x", Value::String("y".into()))]),
            model_specific_versions: HashMap::new(),
        };
        assert!(validate_template(&tpl).is_err());
    }

    #[test]
    fn model_specific_override_selected_by_exact_match() {
        let mut tpl = PromptTemplate {
            id: "t1".into(),
            template_type: PromptTemplateType::Instruction,
            template: "default {{ name }}".into(),
            default_parameters: params(&[("name", Value::String("x".into()))]),
            model_specific_versions: HashMap::new(),
        };
        tpl.model_specific_versions.insert("gpt-4".into(), "override {{ name }}".into());
        assert_eq!(render_text(&tpl, Some("gpt-4"), &HashMap::new()).unwrap(), "override x");
        assert_eq!(render_text(&tpl, Some("other"), &HashMap::new()).unwrap(), "default x");
    }
}
