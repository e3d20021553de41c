//! RSS/Atom source agent (§4.12).
//!
//! Fetches `source_url`, parses `<item>` (RSS) or `<entry>` (Atom)
//! elements with `quick-xml`'s pull reader, and emits one `Document`
//! per entry published after `last_run`. Title/link/author/publish
//! date all land in metadata; the feed's own description/content is
//! the document body.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, Document};

#[derive(Default, Clone)]
struct FeedEntry {
    title: String,
    link: String,
    content: String,
    author: String,
    published: Option<DateTime<Utc>>,
}

pub async fn run(config: &AgentConfig) -> Result<Vec<Document>> {
    let response = reqwest::get(&config.source_url)
        .await
        .map_err(|e| RagError::RemoteUnavailable(format!("failed to fetch feed {}: {e}", config.source_url)))?;

    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(RagError::Transient(format!("rate limited fetching feed {}", config.source_url)));
    }
    if !response.status().is_success() {
        return Err(RagError::RemoteUnavailable(format!("feed {} returned status {}", config.source_url, response.status())));
    }

    let body = response.text().await.map_err(|e| RagError::Transport(format!("failed to read feed body: {e}")))?;
    let entries = parse_feed(&body)?;

    let mut docs: Vec<Document> = entries
        .into_iter()
        .filter(|e| match (config.last_run, e.published) {
            (Some(last), Some(pub_at)) => pub_at > last,
            _ => true,
        })
        .map(|e| {
            let id = if !e.link.is_empty() { e.link.clone() } else { e.title.clone() };
            let mut doc = Document::new(format!("rss:{id}"), e.content);
            doc.metadata.insert("title".to_string(), serde_json::json!(e.title));
            doc.metadata.insert("link".to_string(), serde_json::json!(e.link));
            doc.metadata.insert("author".to_string(), serde_json::json!(e.author));
            if let Some(pub_at) = e.published {
                doc.metadata.insert("published_at".to_string(), serde_json::json!(pub_at.to_rfc3339()));
            }
            doc
        })
        .collect();

    if let Some(max) = config.max_items {
        docs.truncate(max);
    }
    Ok(docs)
}

fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "item" || name == "entry" {
                    current = Some(FeedEntry::default());
                }
                current_tag = name;
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "link" {
                    if let Some(entry) = current.as_mut() {
                        if let Some(href) = e.attributes().flatten().find(|a| a.key.local_name().as_ref() == b"href") {
                            entry.link = String::from_utf8_lossy(&href.value).to_string();
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(entry) = current.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "title" => entry.title = text,
                        "link" => entry.link = text,
                        "description" | "summary" | "content" | "content:encoded" => entry.content = text,
                        "author" | "creator" | "dc:creator" => entry.author = text,
                        "pubDate" | "published" | "updated" => {
                            entry.published = DateTime::parse_from_rfc2822(&text)
                                .map(|d| d.with_timezone(&Utc))
                                .or_else(|_| DateTime::parse_from_rfc3339(&text).map(|d| d.with_timezone(&Utc)))
                                .ok();
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if (name == "item" || name == "entry") && current.is_some() {
                    entries.push(current.take().unwrap());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(RagError::Transport(format!("malformed feed xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0"?>
<rss><channel>
<item>
  <title>First post</title>
  <link>https://example.com/1</link>
  <description>Body one</description>
  <pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate>
</item>
<item>
  <title>Second post</title>
  <link>https://example.com/2</link>
  <description>Body two</description>
  <pubDate>Tue, 02 Jan 2024 00:00:00 +0000</pubDate>
</item>
</channel></rss>"#;

    #[test]
    fn parses_rss_items() {
        let entries = parse_feed(SAMPLE_RSS).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "First post");
        assert_eq!(entries[1].link, "https://example.com/2");
        assert!(entries[0].published.is_some());
    }
}
