use anyhow::Result;
use tokenizers::Tokenizer;

/// Incremental detokenizer.
///
/// Re-decodes the generated tokens on every step and hands out only the new
/// suffix. Text ending in U+FFFD is held back, since that means a multi-byte
/// character is split across tokens and the next token will complete it.
pub struct IncrementalDecoder<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    emitted: usize,
}

impl<'a> IncrementalDecoder<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            emitted: 0,
        }
    }

    /// Push a token and return the newly completed text, if any.
    pub fn push(&mut self, token: u32) -> Result<Option<String>> {
        self.tokens.push(token);
        let text = self.decode()?;
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        Ok(self.take_suffix(&text))
    }

    /// Flush whatever is left once generation stops.
    pub fn finish(&mut self) -> Result<Option<String>> {
        let text = self.decode()?;
        Ok(self.take_suffix(&text))
    }

    fn decode(&self) -> Result<String> {
        self.tokenizer
            .decode(&self.tokens, true)
            .map_err(|e| anyhow::anyhow!("Tokenizer decode error: {}", e))
    }

    fn take_suffix(&mut self, text: &str) -> Option<String> {
        if text.len() <= self.emitted || !text.is_char_boundary(self.emitted) {
            return None;
        }
        let delta = text[self.emitted..].to_string();
        self.emitted = text.len();
        Some(delta)
    }
}
