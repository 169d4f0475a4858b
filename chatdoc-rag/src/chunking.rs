//! Sentence-packing text chunker.
//!
//! Extracted document text is split into bounded passages before embedding.
//! The algorithm is deterministic and side-effect-free:
//!
//! 1. Collapse every run of whitespace into a single space.
//! 2. Split into sentences after `.`, `!`, or `?` followed by whitespace.
//! 3. Greedily pack sentences into chunks of at most `chunk_size` characters.
//!    Sentences longer than `chunk_size` are split on word boundaries first.
//! 4. Give every chunk but the last a tail of up to `overlap` leading words of
//!    the next chunk, as far as the character budget allows.
//!
//! Sizes are measured in characters (Unicode scalar values), not bytes.

use crate::error::{RagError, Result};

/// A strategy for splitting extracted text into passages.
pub trait Chunker: Send + Sync {
    /// Split text into passages. Returns an empty `Vec` for blank text.
    fn chunk(&self, text: &str) -> Vec<String>;

    /// The maximum passage length in characters.
    fn chunk_size(&self) -> usize;

    /// The number of overlap words carried between adjacent passages.
    fn overlap(&self) -> usize;
}

/// Packs whole sentences into chunks of at most `chunk_size` characters,
/// with up to `overlap` words of lookahead appended to each chunk.
///
/// # Example
///
/// ```rust,ignore
/// use chatdoc_rag::{Chunker, SentenceChunker};
///
/// let chunker = SentenceChunker::new(500, 100)?;
/// let passages = chunker.chunk(&extracted_text);
/// ```
#[derive(Debug, Clone)]
pub struct SentenceChunker {
    chunk_size: usize,
    overlap: usize,
}

impl SentenceChunker {
    /// Create a new `SentenceChunker`.
    ///
    /// # Arguments
    ///
    /// * `chunk_size`: maximum number of characters per chunk
    /// * `overlap`: maximum number of words borrowed from the next chunk
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ChunkingError`] if `chunk_size` is zero.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::ChunkingError("chunk_size must be greater than zero".into()));
        }
        Ok(Self { chunk_size, overlap })
    }
}

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        pack(text, self.chunk_size, self.overlap)
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn overlap(&self) -> usize {
        self.overlap
    }
}

/// Split `text` into overlapping passages of at most `chunk_size` characters.
///
/// # Errors
///
/// Returns [`RagError::ChunkingError`] if `chunk_size` is zero.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    Ok(SentenceChunker::new(chunk_size, overlap)?.chunk(text))
}

/// Collapse whitespace runs into single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split normalized text after sentence-terminal punctuation.
///
/// The punctuation stays with its sentence; the separating space is dropped.
pub fn split_sentences(normalized: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = normalized.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(space_pos, ' ')) = chars.peek() {
                sentences.push(&normalized[start..pos + c.len_utf8()]);
                start = space_pos + 1;
                chars.next();
            }
        }
    }

    if start < normalized.len() {
        sentences.push(&normalized[start..]);
    }
    sentences
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Running buffer that flushes into `chunks` when the next piece would overflow.
struct Packer {
    chunk_size: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl Packer {
    fn new(chunk_size: usize) -> Self {
        Self { chunk_size, chunks: Vec::new(), current: String::new(), current_len: 0 }
    }

    /// Append `piece` (known to fit in an empty buffer), flushing first if needed.
    fn push(&mut self, piece: &str) {
        let piece_len = char_len(piece);
        if self.current.is_empty() {
            self.current.push_str(piece);
            self.current_len = piece_len;
        } else if self.current_len + 1 + piece_len <= self.chunk_size {
            self.current.push(' ');
            self.current.push_str(piece);
            self.current_len += 1 + piece_len;
        } else {
            self.flush();
            self.current.push_str(piece);
            self.current_len = piece_len;
        }
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
            self.current_len = 0;
        }
    }

    /// Split an over-long sentence on word boundaries.
    ///
    /// The current buffer is flushed first so passages keep their reading order;
    /// the last partial piece stays in the buffer for the next sentence to join.
    fn push_long_sentence(&mut self, sentence: &str) {
        self.flush();
        for word in sentence.split(' ') {
            if char_len(word) > self.chunk_size {
                for piece in hard_split(word, self.chunk_size) {
                    self.push(&piece);
                }
            } else {
                self.push(word);
            }
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

/// Split a single word at character boundaries into pieces of `size` characters.
fn hard_split(word: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars.chunks(size).map(|piece| piece.iter().collect()).collect()
}

fn pack(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut packer = Packer::new(chunk_size);
    for sentence in split_sentences(&normalized) {
        if char_len(sentence) > chunk_size {
            packer.push_long_sentence(sentence);
        } else {
            packer.push(sentence);
        }
    }
    let packed = packer.finish();

    add_overlap(&packed, chunk_size, overlap)
}

/// Append leading words of each chunk's successor while the budget allows.
fn add_overlap(packed: &[String], chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut result = Vec::with_capacity(packed.len());
    for (i, chunk) in packed.iter().enumerate() {
        let mut chunk = chunk.clone();
        if let Some(next) = packed.get(i + 1) {
            let mut len = char_len(&chunk);
            for word in next.split(' ').take(overlap) {
                let word_len = char_len(word);
                if len + 1 + word_len > chunk_size {
                    break;
                }
                chunk.push(' ');
                chunk.push_str(word);
                len += 1 + word_len;
            }
        }
        result.push(chunk);
    }
    result
}
