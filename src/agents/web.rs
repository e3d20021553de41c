//! Web crawler source agent (§4.12).
//!
//! Breadth-first crawl starting at `source_url`, bounded by
//! `options.max_depth` (default 2) and `max_items`. Only same-origin
//! links are followed. Page text is extracted by stripping markup with
//! `scraper`; an optional `options.metadata_selectors` map of CSS
//! selector -> metadata key lets a config pull out e.g. an article's
//! `<h1>` or `<time>` element without a dedicated per-site agent.
//!
//! There's no standalone `url` crate in the dependency stack, so origin
//! comparison and relative-link resolution go through `reqwest::Url`,
//! which re-exports the same type reqwest itself uses to build requests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use scraper::{Html, Selector};

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, Document};

fn default_max_depth() -> u32 {
    2
}

pub async fn run(config: &AgentConfig) -> Result<Vec<Document>> {
    let start = Url::parse(&config.source_url).map_err(|e| RagError::ConfigInvalid(format!("invalid source_url: {e}")))?;
    let origin = start.origin();

    let max_depth = config.options.get("max_depth").and_then(|v| v.as_u64()).map(|v| v as u32).unwrap_or_else(default_max_depth);
    let max_items = config.max_items.unwrap_or(usize::MAX);

    let metadata_selectors: Vec<(String, Selector)> = config
        .options
        .get("metadata_selectors")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(key, sel)| sel.as_str().and_then(|s| Selector::parse(s).ok()).map(|s| (key.clone(), s)))
                .collect()
        })
        .unwrap_or_default();

    let timeout_secs = config.options.get("timeout_secs").and_then(|v| v.as_u64()).unwrap_or(30);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::ConfigInvalid(format!("failed to build http client: {e}")))?;

    let mut visited: HashSet<Url> = HashSet::new();
    let mut queue: VecDeque<(Url, u32)> = VecDeque::new();
    queue.push_back((start, 0));

    let mut docs = Vec::new();

    while let Some((url, depth)) = queue.pop_front() {
        if docs.len() >= max_items {
            break;
        }
        if visited.contains(&url) {
            continue;
        }
        visited.insert(url.clone());

        let response = match client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(RagError::RemoteUnavailable(format!("timed out fetching {url}: {e}")));
                }
                continue;
            }
        };

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RagError::Transient(format!("rate limited while fetching {url}")));
        }
        if !response.status().is_success() {
            continue;
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(_) => continue,
        };

        let html = Html::parse_document(&body);
        let text = extract_text(&html);

        let mut doc = Document::new(format!("web:{url}"), text);
        doc.metadata.insert("url".to_string(), serde_json::json!(url.as_str()));
        doc.metadata.insert("crawl_depth".to_string(), serde_json::json!(depth));
        doc.metadata.insert("crawled_at".to_string(), serde_json::json!(Utc::now().to_rfc3339()));
        for (key, selector) in &metadata_selectors {
            if let Some(el) = html.select(selector).next() {
                let value = el.text().collect::<Vec<_>>().join(" ").trim().to_string();
                doc.metadata.insert(key.clone(), serde_json::json!(value));
            }
        }
        docs.push(doc);

        if depth >= max_depth {
            continue;
        }

        for link in extract_links(&html, &url) {
            if link.origin() == origin && !visited.contains(&link) {
                queue.push_back((link, depth + 1));
            }
        }
    }

    Ok(docs)
}

fn extract_text(html: &Html) -> String {
    let Ok(body_selector) = Selector::parse("body") else {
        return String::new();
    };
    html.select(&body_selector)
        .next()
        .map(|body| {
            body.text()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn extract_links(html: &Html, base: &Url) -> Vec<Url> {
    let Ok(a_selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    html.select(&a_selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .collect()
}

#[allow(dead_code)]
fn selectors_from_mapping(mapping: &HashMap<String, String>) -> Vec<(String, Selector)> {
    mapping.iter().filter_map(|(k, v)| Selector::parse(v).ok().map(|s| (k.clone(), s))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_strips_markup() {
        let html = Html::parse_document("<html><body><h1>Title</h1><p>Hello <b>world</b></p></body></html>");
        let text = extract_text(&html);
        assert!(text.contains("Title"));
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
    }

    #[test]
    fn extract_links_resolves_relative_urls() {
        let html = Html::parse_document(r#"<html><body><a href="/about">About</a><a href="https://other.example/x">Ext</a></body></html>"#);
        let base = Url::parse("https://example.com/blog/post").unwrap();
        let links = extract_links(&html, &base);
        assert!(links.iter().any(|u| u.as_str() == "https://example.com/about"));
        assert!(links.iter().any(|u| u.as_str() == "https://other.example/x"));
    }

    #[test]
    fn same_origin_filter_excludes_other_hosts() {
        let base = Url::parse("https://example.com/").unwrap();
        let same = Url::parse("https://example.com/page").unwrap();
        let other = Url::parse("https://evil.example/page").unwrap();
        assert_eq!(base.origin(), same.origin());
        assert_ne!(base.origin(), other.origin());
    }
}
