pub mod echo;
pub mod llama;
pub mod sampling;
pub mod tokenizer;

use anyhow::Result;

use crate::config::{Backend, ModelArgs};

// ── Model handle contract ─────────────────────────────────────────────────

/// A loaded inference engine. `generate` is blocking and may take seconds;
/// it is only ever called from inside a worker process.
pub trait TextGenerator: Send {
    /// Short backend name used in logs and the worker handshake.
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`, calling `on_token` for each decoded
    /// text chunk.
    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str)) -> Result<GenerationResult>;
}

pub struct GenerationResult {
    pub full_text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

// ── Sampling parameters ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub max_tokens: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.75,
            top_p: Some(1.0),
            top_k: None,
            max_tokens: 256,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

impl From<&ModelArgs> for SamplingParams {
    fn from(args: &ModelArgs) -> Self {
        Self {
            temperature: args.temperature,
            // top-p of 1.0 keeps the whole distribution
            top_p: (args.top_p < 1.0).then_some(args.top_p),
            top_k: args.top_k,
            max_tokens: args.max_tokens,
            repeat_penalty: args.repeat_penalty,
            repeat_last_n: args.repeat_last_n,
            seed: args.seed,
        }
    }
}

// ── Construction ──────────────────────────────────────────────────────────

/// Build the model handle described by `args`. Loads weights eagerly.
pub fn load_generator(args: &ModelArgs) -> Result<Box<dyn TextGenerator>> {
    match args.backend {
        Backend::Echo => {
            tracing::info!("Using echo backend");
            if args.echo_load_delay_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(args.echo_load_delay_ms));
            }
            Ok(Box::new(echo::EchoGenerator::from_args(args)))
        }
        Backend::Llama => {
            let device = select_device(&args.device, args.device_id)?;
            tracing::info!(device = ?device, "Compute device selected");
            let generator = llama::LlamaGenerator::load(
                &args.model_path,
                &args.tokenizer_path,
                &args.prompt_template,
                SamplingParams::from(args),
                &device,
            )?;
            Ok(Box::new(generator))
        }
    }
}

fn select_device(name: &str, ordinal: usize) -> Result<candle_core::Device> {
    let device = match name {
        #[cfg(feature = "cuda")]
        "cuda" => candle_core::Device::new_cuda(ordinal)?,
        #[cfg(feature = "metal")]
        "metal" => candle_core::Device::new_metal(ordinal)?,
        "cpu" => candle_core::Device::Cpu,
        other => {
            tracing::warn!(ordinal, "Unknown device '{}', falling back to CPU", other);
            candle_core::Device::Cpu
        }
    };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        model: ModelArgs,
    }

    fn model_args(extra: &[&str]) -> ModelArgs {
        Harness::try_parse_from(std::iter::once("test").chain(extra.iter().copied()))
            .unwrap()
            .model
    }

    #[test]
    fn full_top_p_disables_nucleus_filtering() {
        let params = SamplingParams::from(&model_args(&[]));
        assert!(params.top_p.is_none());
        assert!((params.temperature - 0.75).abs() < 1e-9);

        let params = SamplingParams::from(&model_args(&["--top-p", "0.9"]));
        assert_eq!(params.top_p, Some(0.9));
    }

    #[test]
    fn echo_backend_loads_without_weights() {
        let mut generator = load_generator(&model_args(&["--backend", "echo"])).unwrap();
        assert_eq!(generator.name(), "echo");
        let result = generator.generate("ping", &mut |_| {}).unwrap();
        assert_eq!(result.full_text, "echo: ping");
    }

    #[test]
    fn llama_backend_reports_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.gguf");
        let args = model_args(&["--model-path", missing.to_str().unwrap()]);
        let err = load_generator(&args).err().expect("loading should fail");
        assert!(format!("{err:#}").contains("absent.gguf"));
    }
}
