//! Token counting and budget clipping for text handed to the model.

use tiktoken_rs::CoreBPE;

use crate::{Error, Result};

/// Rough characters-per-token ratio used to skip counting short texts.
pub const CHARS_PER_TOKEN: usize = 4;

/// Size of the pieces a long text is measured and clipped in.
pub const CHUNK_CHARS: usize = 100;

/// Counts tokens with the GPT-2/GPT-3 byte-pair encoding (`r50k_base`).
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::r50k_base().map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }

    /// Number of tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Clip `text` to at most `max_tokens` tokens.
    ///
    /// Text that already fits is returned unchanged. Otherwise the result is
    /// built from whole [`CHUNK_CHARS`]-character chunks while their summed
    /// token counts stay within the budget; the first chunk that overflows
    /// ends the scan. The result is always a prefix of `text`.
    pub fn clip<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if text.chars().count() <= max_tokens.saturating_mul(CHARS_PER_TOKEN)
            && self.count(text) <= max_tokens
        {
            return text;
        }

        let mut used = 0;
        let mut end = 0;
        for chunk in chunks(text, CHUNK_CHARS) {
            used += self.count(chunk);
            if used > max_tokens {
                break;
            }
            end += chunk.len();
        }
        &text[..end]
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &"r50k_base")
            .finish()
    }
}

/// Split on char boundaries into pieces of `size` characters (the last may be shorter).
fn chunks(text: &str, size: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let split = rest
            .char_indices()
            .nth(size)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(split);
        rest = tail;
        Some(head)
    })
}
