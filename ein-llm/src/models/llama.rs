use std::path::Path;

use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::Tokenizer;

use super::sampling::{self, Sampler};
use super::tokenizer::IncrementalDecoder;
use super::{GenerationResult, SamplingParams, TextGenerator};

const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|eot_id|>", "<|end_of_text|>", "<|endoftext|>"];

/// Llama-family text generation from quantized GGUF weights via Candle.
pub struct LlamaGenerator {
    model: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: Option<u32>,
    prompt_template: String,
    params: SamplingParams,
}

impl LlamaGenerator {
    /// Load GGUF weights and a `tokenizer.json` from local paths.
    pub fn load(
        model_path: &Path,
        tokenizer_path: &Path,
        prompt_template: &str,
        params: SamplingParams,
        device: &Device,
    ) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("Model file not found: {}", model_path.display());
        }
        tracing::info!(path = %model_path.display(), "Loading GGUF model");

        let mut file = std::fs::File::open(model_path)
            .with_context(|| format!("opening {}", model_path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| e.with_path(model_path))?;
        let model = ModelWeights::from_gguf(content, &mut file, device)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e)
        })?;

        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));
        if eos_token_id.is_none() {
            tracing::warn!("Tokenizer has no known end-of-sequence token; generation stops at max_tokens");
        }

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            eos_token_id,
            prompt_template: prompt_template.to_string(),
            params,
        })
    }

    fn render_prompt(&self, question: &str) -> String {
        render_template(&self.prompt_template, question)
    }

    fn penalized(&self, logits: &Tensor, history: &[u32]) -> Result<Tensor> {
        let start = history.len().saturating_sub(self.params.repeat_last_n);
        let recent: &[u32] = if self.params.repeat_last_n > 0 { &history[start..] } else { &[] };
        sampling::apply_repeat_penalty(logits, self.params.repeat_penalty, recent)
    }
}

/// Substitute the question into a template; a template without the
/// placeholder gets the question appended on its own line.
pub fn render_template(template: &str, question: &str) -> String {
    if template.contains("{question}") {
        template.replace("{question}", question)
    } else {
        format!("{template}\n{question}")
    }
}

impl TextGenerator for LlamaGenerator {
    fn name(&self) -> &str {
        "llama"
    }

    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str)) -> Result<GenerationResult> {
        let full_prompt = self.render_prompt(prompt);
        let encoding = self
            .tokenizer
            .encode(full_prompt.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenizer encode error: {}", e))?;
        let prompt_tokens = encoding.get_ids().to_vec();
        if prompt_tokens.is_empty() {
            anyhow::bail!("Prompt encoded to zero tokens");
        }

        tracing::debug!(prompt_tokens = prompt_tokens.len(), "Starting generation");

        let mut sampler = Sampler::new(&self.params);
        let mut decoder = IncrementalDecoder::new(&self.tokenizer);
        let mut history = prompt_tokens.clone();
        let mut full_text = String::new();
        let mut generated = 0usize;

        // Position 0 resets the KV cache, so each call starts from a clean state.
        let mut input = Tensor::new(prompt_tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let mut position = 0usize;

        while generated < self.params.max_tokens {
            let logits = self.model.forward(&input, position)?.squeeze(0)?;
            let logits = self.penalized(&logits, &history)?;
            let next = sampler.sample(&logits)?;

            position += input.dim(1)?;
            generated += 1;
            history.push(next);

            if Some(next) == self.eos_token_id {
                break;
            }
            if let Some(text) = decoder.push(next)? {
                full_text.push_str(&text);
                on_token(&text);
            }

            input = Tensor::new(&[next], &self.device)?.unsqueeze(0)?;
        }

        if let Some(text) = decoder.finish()? {
            full_text.push_str(&text);
            on_token(&text);
        }

        tracing::debug!(
            prompt_tokens = prompt_tokens.len(),
            completion_tokens = generated,
            "Generation complete"
        );

        Ok(GenerationResult {
            full_text,
            prompt_tokens: prompt_tokens.len() as u64,
            completion_tokens: generated as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_question() {
        assert_eq!(
            render_template("Question: {question}", "What is 2+2?"),
            "Question: What is 2+2?"
        );
    }

    #[test]
    fn template_without_placeholder_appends_question() {
        assert_eq!(render_template("You are terse.", "Why?"), "You are terse.\nWhy?");
    }
}
