//! Text chunker (C6).
//!
//! Splits a document's body text into [`Chunk`]s using one of four
//! modes — character window, approximate token window, sentence, or
//! paragraph — each respecting `chunk_size`/`chunk_overlap`. An atom too
//! large to fit in one chunk on its own (a giant paragraph, say) falls
//! back recursively to the next-finer mode instead of being emitted
//! oversized. Chunk ids are deterministic (`Chunk::make_id`), never
//! randomly generated, so re-chunking the same document after a content
//! edit reuses the same id space.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::models::Chunk;

/// Which splitting strategy to use (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    Character,
    Token,
    Sentence,
    Paragraph,
}

impl ChunkMode {
    /// The mode an oversized atom recursively falls back to.
    fn next_finer(self) -> Option<ChunkMode> {
        match self {
            ChunkMode::Paragraph => Some(ChunkMode::Sentence),
            ChunkMode::Sentence => Some(ChunkMode::Token),
            ChunkMode::Token => Some(ChunkMode::Character),
            ChunkMode::Character => None,
        }
    }
}

/// Chunking configuration (§6 `[chunking]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_mode")]
    pub mode: ChunkMode,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_mode() -> ChunkMode {
    ChunkMode::Paragraph
}
fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    64
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

/// Ratio used to convert a token budget into an approximate word budget
/// for [`ChunkMode::Token`] (§4.5/§4.6: `tokens ≈ 0.75 · words`).
const TOKENS_PER_WORD: f64 = 0.75;

fn sentence_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:[.?!]+)\s+").unwrap())
}

fn split_sentences(text: &str) -> Vec<String> {
    sentence_splitter()
        .split(text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn take_suffix_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect()
}

/// Group already-split atoms into windows of at most `chunk_size`
/// characters, carrying `chunk_overlap` characters of trailing context
/// into the next window. Atoms too large to fit on their own recurse
/// into `next_mode`.
fn group_atoms_with_overlap(atoms: &[String], config: &ChunkingConfig, next_mode: ChunkMode, separator: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for atom in atoms {
        if atom.chars().count() > config.chunk_size {
            if !buf.trim().is_empty() {
                out.push(buf.trim().to_string());
            }
            buf.clear();
            let sub_config = ChunkingConfig {
                mode: next_mode,
                chunk_size: config.chunk_size,
                chunk_overlap: config.chunk_overlap,
            };
            out.extend(split_into_pieces(atom, &sub_config));
            continue;
        }

        let candidate_len = if buf.is_empty() {
            atom.chars().count()
        } else {
            buf.chars().count() + separator.chars().count() + atom.chars().count()
        };

        if candidate_len > config.chunk_size && !buf.is_empty() {
            out.push(buf.trim().to_string());
            buf = take_suffix_chars(&buf, config.chunk_overlap.min(config.chunk_size.saturating_sub(1)));
        }

        if !buf.is_empty() {
            buf.push_str(separator);
        }
        buf.push_str(atom);
    }

    if !buf.trim().is_empty() {
        out.push(buf.trim().to_string());
    }
    out
}

fn split_character(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= config.chunk_size {
        let piece = text.trim().to_string();
        return if piece.is_empty() { Vec::new() } else { vec![piece] };
    }

    let step = config
        .chunk_size
        .saturating_sub(config.chunk_overlap)
        .max(1);
    let mut out = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.chunk_size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim().to_string();
        if !trimmed.is_empty() {
            out.push(trimmed);
        }
        if end >= chars.len() {
            break;
        }
        start += step;
    }
    out
}

fn split_token(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let word_budget = ((config.chunk_size as f64) / TOKENS_PER_WORD).floor().max(1.0) as usize;
    if words.len() <= word_budget {
        let piece = text.trim().to_string();
        return if piece.is_empty() { Vec::new() } else { vec![piece] };
    }

    let word_overlap = ((config.chunk_overlap as f64) / TOKENS_PER_WORD)
        .floor()
        .min((word_budget.saturating_sub(1)) as f64)
        .max(0.0) as usize;
    let step = word_budget.saturating_sub(word_overlap).max(1);

    let mut out = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + word_budget).min(words.len());
        out.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }
        start += step;
    }
    out
}

/// Dispatch on `config.mode` and return ordered, non-empty chunk texts.
/// Internal to the module — callers use [`chunk_text`], which attaches
/// deterministic ids.
fn split_into_pieces(text: &str, config: &ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match config.mode {
        ChunkMode::Character => split_character(text, config),
        ChunkMode::Token => split_token(text, config),
        ChunkMode::Sentence => {
            let atoms = split_sentences(text);
            group_atoms_with_overlap(&atoms, config, ChunkMode::Token, " ")
        }
        ChunkMode::Paragraph => {
            let atoms = split_paragraphs(text);
            group_atoms_with_overlap(&atoms, config, ChunkMode::Sentence, "\n\n")
        }
    }
}

/// Split `text` belonging to `document_id` into [`Chunk`]s. Returns no
/// chunks for empty (or all-whitespace) input; otherwise at least one
/// chunk. Indices (and therefore ids) are contiguous and reflect source
/// order.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let pieces = split_into_pieces(text, config);
    let pieces = if pieces.is_empty() {
        vec![text.trim().to_string()]
    } else {
        pieces
    };

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| Chunk {
            id: Chunk::make_id(document_id, index),
            document_id: document_id.to_string(),
            chunk_index: index,
            text: piece,
            metadata: Default::default(),
            embeddings: Default::default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode: ChunkMode, size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            mode,
            chunk_size: size,
            chunk_overlap: overlap,
        }
    }

    #[test]
    fn small_text_is_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", &cfg(ChunkMode::Paragraph, 700, 50));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].id, "doc1_0");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunk_text("doc1", "", &cfg(ChunkMode::Paragraph, 700, 50));
        assert!(chunks.is_empty());
    }

    #[test]
    fn whitespace_only_text_yields_no_chunks() {
        let chunks = chunk_text("doc1", "   \n\t  ", &cfg(ChunkMode::Paragraph, 700, 50));
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_ids_are_deterministic_and_contiguous() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {i} with some filler text to pad it out."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let config = cfg(ChunkMode::Paragraph, 80, 10);
        let c1 = chunk_text("doc1", &text, &config);
        let c2 = chunk_text("doc1", &text, &config);
        assert_eq!(c1.len(), c2.len());
        for (i, (a, b)) in c1.iter().zip(c2.iter()).enumerate() {
            assert_eq!(a.id, format!("doc1_{i}"));
            assert_eq!(a.text, b.text);
        }
    }

    #[test]
    fn no_chunk_is_ever_empty() {
        let text = "A.\n\n\n\nB.\n\nC.";
        let chunks = chunk_text("doc1", text, &cfg(ChunkMode::Paragraph, 5, 0));
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn character_mode_respects_window_and_overlap() {
        let text = "a".repeat(100);
        let chunks = chunk_text("doc1", &text, &cfg(ChunkMode::Character, 30, 5));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 30);
        }
    }

    #[test]
    fn token_mode_respects_word_budget() {
        let text = (0..50).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        // budget = floor(10 / 0.75) = 13 words per chunk
        let chunks = chunk_text("doc1", &text, &cfg(ChunkMode::Token, 10, 0));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.split_whitespace().count() <= 14);
        }
    }

    #[test]
    fn sentence_mode_splits_on_punctuation() {
        let text = "First sentence. Second sentence! Third sentence? Fourth one.";
        let chunks = chunk_text("doc1", text, &cfg(ChunkMode::Sentence, 25, 0));
        assert!(chunks.len() > 1);
    }

    #[test]
    fn oversized_paragraph_falls_back_to_sentence_mode() {
        let huge_paragraph = "Sentence one is here. Sentence two is here. Sentence three is here. Sentence four follows too.";
        let chunks = chunk_text("doc1", huge_paragraph, &cfg(ChunkMode::Paragraph, 30, 0));
        assert!(chunks.len() > 1, "oversized paragraph should split via sentence fallback");
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn output_order_preserves_source_order() {
        let text = "Alpha.\n\nBeta.\n\nGamma.\n\nDelta.";
        let chunks = chunk_text("doc1", text, &cfg(ChunkMode::Paragraph, 1000, 0));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.find("Alpha").unwrap() < chunks[0].text.find("Delta").unwrap());
    }
}
