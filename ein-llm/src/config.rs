use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pool::RestartPolicy;

#[derive(Parser, Debug)]
#[command(name = "ein-llm", about = "Question-answering HTTP server over local LLM worker processes")]
pub struct CliArgs {
    /// Log level (NOTSET, TRACE, DEBUG, INFO, WARNING, ERROR, FATAL)
    #[arg(long, global = true, value_enum, ignore_case = true, default_value = "debug", env = "EIN_LLM_LOG_LEVEL")]
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "EIN_LLM_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server and its worker pool
    Serve(ServeArgs),
    /// Run a single inference worker over NDJSON stdio (spawned by `serve`)
    Worker(WorkerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "EIN_LLM_HOST")]
    pub host: String,

    /// Port to bind
    #[arg(long, default_value = "8000", env = "EIN_LLM_PORT")]
    pub port: u16,

    /// Directory served under /static
    #[arg(long, default_value = "static", env = "EIN_LLM_STATIC_DIR")]
    pub static_dir: PathBuf,

    /// Disable permissive CORS headers
    #[arg(long)]
    pub no_cors: bool,

    /// Number of worker processes
    #[arg(long, default_value = "1", env = "EIN_LLM_WORKERS")]
    pub workers: usize,

    /// What to do with a slot whose worker process died
    #[arg(long, value_enum, default_value = "respawn", env = "EIN_LLM_RESTART")]
    pub restart: RestartPolicy,

    /// Wall-clock limit per inference call in seconds (0 disables the limit)
    #[arg(long, default_value = "0", env = "EIN_LLM_GENERATION_TIMEOUT")]
    pub generation_timeout: u64,

    /// Time allowed for a worker to load its model and report ready, in seconds
    #[arg(long, default_value = "600", env = "EIN_LLM_WORKER_START_TIMEOUT")]
    pub worker_start_timeout: u64,

    #[command(flatten)]
    pub model: ModelArgs,
}

impl ServeArgs {
    pub fn job_timeout(&self) -> Option<Duration> {
        (self.generation_timeout > 0).then(|| Duration::from_secs(self.generation_timeout))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_start_timeout)
    }
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub model: ModelArgs,
}

/// Model handle settings shared by `serve` (which forwards them) and `worker`.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ModelArgs {
    /// Model backend
    #[arg(long, value_enum, default_value = "llama", env = "EIN_LLM_BACKEND")]
    pub backend: Backend,

    /// Path to the GGUF model weights
    #[arg(long, default_value = "static/model.gguf", env = "EIN_LLM_MODEL_PATH")]
    pub model_path: PathBuf,

    /// Path to tokenizer.json
    #[arg(long, default_value = "static/tokenizer.json", env = "EIN_LLM_TOKENIZER_PATH")]
    pub tokenizer_path: PathBuf,

    /// Temperature for generation
    #[arg(long, default_value = "0.75", env = "EIN_LLM_TEMPERATURE")]
    pub temperature: f64,

    /// Top-p (nucleus sampling)
    #[arg(long, default_value = "1.0", env = "EIN_LLM_TOP_P")]
    pub top_p: f64,

    /// Top-k filtering
    #[arg(long, env = "EIN_LLM_TOP_K")]
    pub top_k: Option<usize>,

    /// Maximum tokens to generate
    #[arg(long, default_value = "256", env = "EIN_LLM_MAX_TOKENS")]
    pub max_tokens: usize,

    /// Repeat penalty
    #[arg(long, default_value = "1.1")]
    pub repeat_penalty: f32,

    /// Number of trailing tokens the repeat penalty looks at
    #[arg(long, default_value = "64")]
    pub repeat_last_n: usize,

    /// Seed for the sampling PRNG
    #[arg(long, env = "EIN_LLM_SEED")]
    pub seed: Option<u64>,

    /// Prompt template; `{question}` is replaced by the question text
    #[arg(long, default_value = "Question: {question}", env = "EIN_LLM_PROMPT_TEMPLATE")]
    pub prompt_template: String,

    /// Device: "cpu", "cuda", "metal"
    #[arg(long, default_value = "cpu", env = "EIN_LLM_DEVICE")]
    pub device: String,

    /// CUDA device ordinal (when --device cuda)
    #[arg(long, default_value = "0")]
    pub device_id: usize,

    /// Echo backend: artificial latency per call in milliseconds
    #[arg(long, default_value = "0")]
    pub echo_delay_ms: u64,

    /// Echo backend: artificial model loading time in milliseconds
    #[arg(long, default_value = "0")]
    pub echo_load_delay_ms: u64,

    /// Echo backend: prompts containing this text fail with an inference error
    #[arg(long)]
    pub echo_fail_marker: Option<String>,

    /// Echo backend: prompts containing this text terminate the worker process
    #[arg(long)]
    pub echo_crash_marker: Option<String>,
}

impl ModelArgs {
    /// Render these settings back into `worker` command-line flags.
    ///
    /// Values are attached with `=` so ones starting with `-` are not read
    /// as flags by the worker.
    pub fn to_worker_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--backend={}", self.backend.as_str()),
            format!("--model-path={}", self.model_path.display()),
            format!("--tokenizer-path={}", self.tokenizer_path.display()),
            format!("--temperature={}", self.temperature),
            format!("--top-p={}", self.top_p),
            format!("--max-tokens={}", self.max_tokens),
            format!("--repeat-penalty={}", self.repeat_penalty),
            format!("--repeat-last-n={}", self.repeat_last_n),
            format!("--prompt-template={}", self.prompt_template),
            format!("--device={}", self.device),
            format!("--device-id={}", self.device_id),
            format!("--echo-delay-ms={}", self.echo_delay_ms),
            format!("--echo-load-delay-ms={}", self.echo_load_delay_ms),
        ];
        if let Some(k) = self.top_k {
            args.push(format!("--top-k={k}"));
        }
        if let Some(seed) = self.seed {
            args.push(format!("--seed={seed}"));
        }
        if let Some(marker) = &self.echo_fail_marker {
            args.push(format!("--echo-fail-marker={marker}"));
        }
        if let Some(marker) = &self.echo_crash_marker {
            args.push(format!("--echo-crash-marker={marker}"));
        }
        args
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Quantized GGUF Llama-family model via Candle
    Llama,
    /// Returns "echo: <prompt>" without loading any weights
    Echo,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Echo => "echo",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Notset,
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Notset | Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Fatal => "error",
        }
    }

    /// The `--log-level` spelling, for forwarding to worker processes.
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Notset => "notset",
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}
