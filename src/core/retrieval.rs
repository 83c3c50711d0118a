//! Lexical retrieval over caller-supplied knowledge files.
//!
//! Files are cut into overlapping character windows, each window is scored
//! by how many distinct query keywords it contains, and the best windows are
//! concatenated into a context block no longer than `max_chars` characters.

use serde::{Deserialize, Serialize};

use crate::core::lanes::Lane;

pub const DEFAULT_MAX_CHARS: usize = 30_000;
pub const WINDOW_CHARS: usize = 800;
pub const WINDOW_OVERLAP: usize = 100;
pub const MAX_CHUNKS: usize = 15;
/// Per-file excerpt used when the query has no usable keywords.
pub const FALLBACK_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub name: String,
    pub text: String,
    /// Size of the source file in bytes.
    pub size: usize,
    pub active: bool,
    /// Lanes this file is enabled for; `None` means every lane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lanes: Option<Vec<Lane>>,
}

impl KnowledgeFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            name: name.into(),
            size: text.len(),
            text,
            active: true,
            lanes: None,
        }
    }

    pub fn for_lanes(mut self, lanes: Vec<Lane>) -> Self {
        self.lanes = Some(lanes);
        self
    }

    pub fn is_enabled_for(&self, lane: Lane) -> bool {
        self.active
            && self
                .lanes
                .as_ref()
                .is_none_or(|lanes| lanes.contains(&lane))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredChunk {
    pub file_name: String,
    pub text: String,
    pub score: usize,
}

impl ScoredChunk {
    fn render(&self) -> String {
        format!(
            "[Source: {} (score: {})]\n{}\n\n",
            self.file_name, self.score, self.text
        )
    }
}

/// Lowercased, punctuation-free query terms longer than one character, in
/// first-seen order without duplicates.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let cleaned: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let mut keywords: Vec<String> = Vec::new();
    for token in cleaned.split_whitespace() {
        if token.chars().count() > 1 && !keywords.iter().any(|k| k == token) {
            keywords.push(token.to_string());
        }
    }
    keywords
}

/// Overlapping windows of `WINDOW_CHARS` characters, stepping by
/// `WINDOW_CHARS - WINDOW_OVERLAP`. The last window ends at the text's end.
pub fn chunk_windows(text: &str) -> Vec<&str> {
    let mut boundaries: Vec<usize> = text.char_indices().map(|(index, _)| index).collect();
    boundaries.push(text.len());
    let char_count = boundaries.len() - 1;
    if char_count == 0 {
        return Vec::new();
    }

    let step = WINDOW_CHARS - WINDOW_OVERLAP;
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + WINDOW_CHARS).min(char_count);
        windows.push(&text[boundaries[start]..boundaries[end]]);
        if end == char_count {
            break;
        }
        start += step;
    }
    windows
}

/// Highest-scoring windows across active files, best first. Ties keep
/// document order.
pub fn score_chunks(keywords: &[String], files: &[KnowledgeFile]) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = files
        .iter()
        .filter(|file| file.active)
        .flat_map(|file| {
            chunk_windows(&file.text)
                .into_iter()
                .filter_map(|window| {
                    let lower = window.to_lowercase();
                    let score = keywords
                        .iter()
                        .filter(|keyword| lower.contains(keyword.as_str()))
                        .count();
                    (score > 0).then(|| ScoredChunk {
                        file_name: file.name.clone(),
                        text: window.to_string(),
                        score,
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect();

    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored.truncate(MAX_CHUNKS);
    scored
}

/// Build the context block for `query`. Empty when no window matches.
pub fn retrieve(query: &str, files: &[KnowledgeFile], max_chars: usize) -> String {
    let keywords = extract_keywords(query);
    if keywords.is_empty() {
        return fallback_excerpts(files, max_chars);
    }

    let entries = score_chunks(&keywords, files)
        .iter()
        .map(ScoredChunk::render)
        .collect::<Vec<_>>();
    concat_within(entries, max_chars)
}

fn fallback_excerpts(files: &[KnowledgeFile], max_chars: usize) -> String {
    let entries = files
        .iter()
        .filter(|file| file.active && !file.text.is_empty())
        .map(|file| {
            let excerpt: String = file.text.chars().take(FALLBACK_CHARS).collect();
            format!("[Source: {}]\n{}\n\n", file.name, excerpt)
        })
        .collect::<Vec<_>>();
    concat_within(entries, max_chars)
}

fn concat_within(entries: Vec<String>, max_chars: usize) -> String {
    let mut block = String::new();
    let mut used = 0;
    for entry in entries {
        let len = entry.chars().count();
        if used + len > max_chars {
            break;
        }
        block.push_str(&entry);
        used += len;
    }
    block
}

/// Append a retrieved context block and a restatement of the question to the
/// base system instruction.
pub fn augment_system_instruction(base: Option<&str>, context: &str, question: &str) -> String {
    let mut instruction = String::new();
    if let Some(base) = base.map(str::trim).filter(|base| !base.is_empty()) {
        instruction.push_str(base);
        instruction.push_str("\n\n");
    }
    instruction.push_str(
        "Use the following excerpts from the user's reference documents when they are relevant. \
         Each excerpt names its source file.\n\n",
    );
    instruction.push_str(context);
    instruction.push_str("User question: ");
    instruction.push_str(question.trim());
    instruction
}

#[cfg(any(test, feature = "bench"))]
pub mod fixtures {
    use super::KnowledgeFile;

    const FILLER: &str = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod tempor ";

    /// `count` files of roughly `chars` characters each, with one planted
    /// phrase near the end of every file.
    pub fn synthetic_corpus(count: usize, chars: usize, phrase: &str) -> Vec<KnowledgeFile> {
        (0..count)
            .map(|index| {
                let mut text = FILLER.repeat(chars / FILLER.len() + 1);
                text.truncate(chars);
                text.push_str(phrase);
                KnowledgeFile::new(format!("doc-{index}.txt"), text)
            })
            .collect()
    }
}
