use crate::error::IndexError;
use crate::models::TextChunk;

pub const DEFAULT_CHUNK_TOKENS: usize = 500;
pub const DEFAULT_OVERLAP_TOKENS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size_tokens: DEFAULT_CHUNK_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl ChunkingConfig {
    pub fn new(size_tokens: usize, overlap_tokens: usize) -> Result<Self, IndexError> {
        let config = Self {
            size_tokens,
            overlap_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.size_tokens == 0 {
            return Err(IndexError::InvalidChunkConfig(
                "chunk size must be at least one token".to_string(),
            ));
        }
        if self.overlap_tokens >= self.size_tokens {
            return Err(IndexError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                self.overlap_tokens, self.size_tokens
            )));
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.size_tokens - self.overlap_tokens
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits `text` on whitespace and emits windows of `size_tokens` tokens that
/// advance by `size_tokens - overlap_tokens`. The last window may be shorter;
/// no window is emitted once the text end has been reached.
pub fn chunk_tokens(text: &str, config: ChunkingConfig) -> Result<Vec<TextChunk>, IndexError> {
    config.validate()?;

    let tokens = text.split_whitespace().collect::<Vec<_>>();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < tokens.len() {
        let end = (start + config.size_tokens).min(tokens.len());
        chunks.push(TextChunk {
            text: tokens[start..end].join(" "),
            start_index: start,
            end_index: end,
        });
        if end == tokens.len() {
            break;
        }
        start += config.stride();
    }

    Ok(chunks)
}
