use std::time::Duration;

use anyhow::Result;

use super::{GenerationResult, TextGenerator};
use crate::config::ModelArgs;

/// Exit status used when the crash marker is hit.
pub const CRASH_EXIT_CODE: i32 = 86;

/// Weightless backend that answers `"echo: " + prompt`.
///
/// Lets the server run end to end without model files. The optional markers
/// make a call fail or take the whole worker process down, so failure paths
/// can be exercised against real worker processes.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    delay: Duration,
    fail_marker: Option<String>,
    crash_marker: Option<String>,
}

impl EchoGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_args(args: &ModelArgs) -> Self {
        Self {
            delay: Duration::from_millis(args.echo_delay_ms),
            fail_marker: args.echo_fail_marker.clone(),
            crash_marker: args.echo_crash_marker.clone(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fail_marker(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }
}

fn contains_marker(prompt: &str, marker: &Option<String>) -> bool {
    marker.as_deref().is_some_and(|m| !m.is_empty() && prompt.contains(m))
}

impl TextGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str)) -> Result<GenerationResult> {
        if contains_marker(prompt, &self.crash_marker) {
            tracing::error!("Crash marker received, terminating worker");
            std::process::exit(CRASH_EXIT_CODE);
        }

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        if contains_marker(prompt, &self.fail_marker) {
            anyhow::bail!("echo backend refused prompt containing {:?}", self.fail_marker.as_deref().unwrap_or_default());
        }

        let full_text = format!("echo: {prompt}");
        let words: Vec<&str> = prompt.split_whitespace().collect();
        for word in &words {
            on_token(word);
        }

        Ok(GenerationResult {
            full_text,
            prompt_tokens: words.len() as u64,
            completion_tokens: words.len() as u64 + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_prompt_with_prefix() {
        let mut generator = EchoGenerator::new();
        let result = generator.generate("What is 2+2?", &mut |_| {}).unwrap();
        assert_eq!(result.full_text, "echo: What is 2+2?");
        assert_eq!(result.prompt_tokens, 3);
    }

    #[test]
    fn emits_one_chunk_per_word() {
        let mut generator = EchoGenerator::new();
        let mut chunks = Vec::new();
        generator
            .generate("a b c", &mut |t| chunks.push(t.to_string()))
            .unwrap();
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[test]
    fn fail_marker_produces_error_with_context() {
        let mut generator = EchoGenerator::new().with_fail_marker("boom");
        let err = generator.generate("please boom now", &mut |_| {}).err().unwrap();
        assert!(err.to_string().contains("boom"));

        let ok = generator.generate("all quiet", &mut |_| {}).unwrap();
        assert_eq!(ok.full_text, "echo: all quiet");
    }

    #[test]
    fn empty_marker_never_matches() {
        let mut generator = EchoGenerator::new().with_fail_marker("");
        assert!(generator.generate("anything", &mut |_| {}).is_ok());
    }

    #[test]
    fn delay_is_applied() {
        let mut generator = EchoGenerator::new().with_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        generator.generate("slow", &mut |_| {}).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
