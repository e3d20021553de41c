//! Filesystem source agent (§4.12).
//!
//! Walks `source_url` recursively, filters by extension, and — when
//! `options.check_mtime` is set — skips files whose modification time is
//! at or before `last_run`, so a recurring sync only re-ingests changed
//! files. Grounded on the teacher's filesystem connector: same
//! `walkdir` traversal, same "sort by relative path for deterministic
//! output" rule.

use chrono::{DateTime, TimeZone, Utc};
use walkdir::WalkDir;

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, Document};

pub async fn run(config: &AgentConfig) -> Result<Vec<Document>> {
    let root = std::path::PathBuf::from(&config.source_url);
    if !root.exists() {
        return Err(RagError::ConfigInvalid(format!("filesystem agent root does not exist: {}", root.display())));
    }

    let extensions: Vec<String> = config
        .options
        .get("extensions")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(|s| s.to_lowercase())).collect())
        .unwrap_or_default();

    let check_mtime = config.options.get("check_mtime").and_then(|v| v.as_bool()).unwrap_or(false);

    let root_clone = root.clone();
    let last_run = config.last_run;
    let docs = tokio::task::spawn_blocking(move || walk(&root_clone, &extensions, check_mtime.then_some(last_run).flatten()))
        .await
        .map_err(|e| RagError::Transient(format!("filesystem walk task failed: {e}")))??;

    Ok(docs)
}

fn walk(root: &std::path::Path, extensions: &[String], since: Option<DateTime<Utc>>) -> Result<Vec<Document>> {
    let mut docs = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| RagError::Transient(format!("directory walk error: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !extensions.is_empty() {
            let ext = path.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
            if !extensions.contains(&ext) {
                continue;
            }
        }

        let metadata = std::fs::metadata(path).map_err(|e| RagError::Transient(format!("stat failed for {}: {e}", path.display())))?;
        let modified = metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let modified_at = Utc.timestamp_opt(
            modified.duration_since(std::time::SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs() as i64,
            0,
        ).single().unwrap_or_else(Utc::now);

        if let Some(since) = since {
            if modified_at <= since {
                continue;
            }
        }

        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };

        let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string();
        let mut doc = Document::new(format!("fs:{relative}"), text);
        doc.metadata.insert("source_path".to_string(), serde_json::json!(relative));
        doc.metadata.insert("modified_at".to_string(), serde_json::json!(modified_at.to_rfc3339()));
        docs.push(doc);
    }

    docs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;

    #[tokio::test]
    async fn reads_matching_text_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "hello world").unwrap();
        std::fs::write(dir.path().join("b.bin"), [0u8, 1, 2]).unwrap();

        let mut config = AgentConfig::new(AgentType::Filesystem, "docs", "interval:1h");
        config.source_url = dir.path().to_string_lossy().to_string();
        config.options.insert("extensions".to_string(), serde_json::json!(["md"]));

        let docs = run(&config).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].text.contains("hello world"));
    }

    #[tokio::test]
    async fn missing_root_is_config_invalid() {
        let mut config = AgentConfig::new(AgentType::Filesystem, "docs", "interval:1h");
        config.source_url = "/nonexistent/path/for/test".to_string();
        assert!(matches!(run(&config).await, Err(RagError::ConfigInvalid(_))));
    }
}
