//! Chunker (C9): turns a converted document's plain text and heading tree
//! into an ordered list of `citeloom_core::model::Chunk`s. Ported in meaning
//! from the teacher's `SemanticChunker` (character-window splitting via
//! `text-splitter`), generalized with token-window overlap and heading
//! attachment per §4.9.

use crate::fulltext::ConversionResult;
use citeloom_core::model::{Chunk, ModelError, PageSpan};
use text_splitter::{Characters, TextSplitter};

/// A heading and the byte offset in the plain text where its section starts.
#[derive(Debug, Clone)]
pub struct HeadingEntry {
    pub text: String,
    pub offset: usize,
    pub depth: u8,
}

#[derive(Debug, Clone, Default)]
pub struct HeadingTree {
    pub headings: Vec<HeadingEntry>,
}

impl HeadingTree {
    /// The two nearest enclosing headings (outer, inner) for a byte offset,
    /// walked from the most specific depth outward (§4.9).
    fn enclosing_path(&self, offset: usize) -> Vec<String> {
        let mut candidates: Vec<&HeadingEntry> =
            self.headings.iter().filter(|h| h.offset <= offset).collect();
        candidates.sort_by_key(|h| h.offset);
        candidates.into_iter().rev().take(2).rev().map(|h| h.text.clone()).collect()
    }
}

pub struct ChunkingInput<'a> {
    pub doc_id: &'a str,
    pub text: &'a str,
    pub headings: &'a HeadingTree,
    pub page_map: &'a std::collections::BTreeMap<u32, (usize, usize)>,
    pub embedding_model_id: &'a str,
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, input: &ChunkingInput) -> Result<Vec<Chunk>, ModelError>;
}

/// Token-window chunker with overlap; used whenever no external hierarchical
/// chunker is configured (§4.9). "Token" here is approximated by
/// `text-splitter`'s character counting, matching the teacher's engine.
pub struct TokenWindowChunker {
    window_chars: usize,
    overlap_chars: usize,
}

impl TokenWindowChunker {
    pub fn new(window_chars: usize, overlap_chars: usize) -> Self {
        Self {
            window_chars: window_chars.max(1),
            overlap_chars: overlap_chars.min(window_chars.saturating_sub(1)),
        }
    }
}

impl Default for TokenWindowChunker {
    fn default() -> Self {
        Self::new(1000, 150)
    }
}

fn page_span_for_offset(page_map: &std::collections::BTreeMap<u32, (usize, usize)>, start: usize, end: usize) -> PageSpan {
    let mut first_page = None;
    let mut last_page = None;
    for (&page, &(page_start, page_end)) in page_map {
        if page_start < end && page_end > start {
            first_page.get_or_insert(page);
            last_page = Some(page);
        }
    }
    let first = first_page.unwrap_or(1);
    let last = last_page.unwrap_or(first);
    PageSpan::new(first, last).unwrap_or(PageSpan::new(first, first).unwrap())
}

impl Chunker for TokenWindowChunker {
    fn chunk(&self, input: &ChunkingInput) -> Result<Vec<Chunk>, ModelError> {
        let splitter = TextSplitter::<Characters>::default().with_trim_chunks(true);
        let mut chunks = Vec::new();
        let mut cursor = 0usize;
        let mut idx = 0u32;

        // text-splitter doesn't expose byte offsets directly, so walk the
        // source text ourselves to keep offsets for page-span/heading lookup.
        let bytes = input.text.as_bytes();
        while cursor < bytes.len() {
            let window_end = (cursor + self.window_chars).min(bytes.len());
            let slice = &input.text[cursor..window_end];
            let piece = splitter.chunks(slice, self.window_chars).next().unwrap_or(slice).to_string();
            let piece_len = piece.len().max(1);

            let section_path = input.headings.enclosing_path(cursor);
            let section_heading = section_path.last().cloned();
            let page_span = page_span_for_offset(input.page_map, cursor, cursor + piece_len);

            let chunk = Chunk::new(
                input.doc_id.to_string(),
                piece,
                page_span,
                section_heading,
                section_path,
                idx,
                input.embedding_model_id,
                None,
                None,
            )?;
            chunks.push(chunk);

            idx += 1;
            let advance = piece_len.saturating_sub(self.overlap_chars).max(1);
            cursor += advance;
        }

        Ok(chunks)
    }
}

/// Hook for an external hierarchical chunker, preferred over the token-window
/// fallback when configured (§4.9).
pub trait ExternalChunker: Send + Sync {
    fn chunk_hierarchical(&self, conversion: &ConversionResult) -> Option<Vec<Chunk>>;
}

pub struct ChunkerPipeline {
    external: Option<Box<dyn ExternalChunker>>,
    fallback: Box<dyn Chunker>,
}

impl ChunkerPipeline {
    pub fn new(external: Option<Box<dyn ExternalChunker>>, fallback: Box<dyn Chunker>) -> Self {
        Self { external, fallback }
    }

    pub fn chunk(&self, input: &ChunkingInput, conversion: &ConversionResult) -> Result<Vec<Chunk>, ModelError> {
        if let Some(external) = &self.external {
            if let Some(chunks) = external.chunk_hierarchical(conversion) {
                return Ok(chunks);
            }
        }
        self.fallback.chunk(input)
    }
}

impl Default for ChunkerPipeline {
    fn default() -> Self {
        Self::new(None, Box::new(TokenWindowChunker::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn chunk_idxs_are_monotonically_non_decreasing_and_cover_all_pages() {
        let text = "a".repeat(3500);
        let mut page_map = BTreeMap::new();
        page_map.insert(1, (0, 1000));
        page_map.insert(2, (1000, 2000));
        page_map.insert(3, (2000, 3500));

        let headings = HeadingTree::default();
        let input = ChunkingInput {
            doc_id: "doc-1",
            text: &text,
            headings: &headings,
            page_map: &page_map,
            embedding_model_id: "m1",
        };

        let chunker = TokenWindowChunker::default();
        let chunks = chunker.chunk(&input).unwrap();

        assert!(!chunks.is_empty());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_idx, i as u32);
        }
        assert_eq!(chunks.first().unwrap().page_span.start, 1);
        assert_eq!(chunks.last().unwrap().page_span.end, 3);
    }

    #[test]
    fn same_input_produces_the_same_ordered_chunk_ids() {
        let text = "word ".repeat(400);
        let mut page_map = BTreeMap::new();
        page_map.insert(1, (0, text.len()));
        let headings = HeadingTree::default();

        let input = ChunkingInput {
            doc_id: "doc-1",
            text: &text,
            headings: &headings,
            page_map: &page_map,
            embedding_model_id: "m1",
        };

        let chunker = TokenWindowChunker::default();
        let a: Vec<String> = chunker.chunk(&input).unwrap().into_iter().map(|c| c.id).collect();
        let b: Vec<String> = chunker.chunk(&input).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn attaches_nearest_two_enclosing_headings() {
        let text = format!("{}{}", "intro text here ".repeat(20), "body text here ".repeat(200));
        let headings = HeadingTree {
            headings: vec![
                HeadingEntry { text: "Chapter 1".to_string(), offset: 0, depth: 1 },
                HeadingEntry { text: "Section 1.1".to_string(), offset: 320, depth: 2 },
            ],
        };
        let mut page_map = BTreeMap::new();
        page_map.insert(1, (0, text.len()));

        let input = ChunkingInput {
            doc_id: "doc-1",
            text: &text,
            headings: &headings,
            page_map: &page_map,
            embedding_model_id: "m1",
        };

        let chunker = TokenWindowChunker::default();
        let chunks = chunker.chunk(&input).unwrap();
        let later_chunk = chunks.iter().find(|c| c.chunk_idx > 0).unwrap();
        assert!(later_chunk.section_path.contains(&"Section 1.1".to_string()));
    }
}
