//! The worker process: owns one model handle and serves `generate` calls over
//! NDJSON stdio, one at a time.

use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hooks::{CallbackManager, Component, LlmResult};
use crate::models::TextGenerator;
use crate::protocol::*;
use crate::transport::NdjsonTransport;

pub struct WorkerServer<W: Write = std::io::Stdout> {
    generator: Box<dyn TextGenerator>,
    callbacks: CallbackManager,
    transport: NdjsonTransport<W>,
    calls: u64,
}

impl WorkerServer {
    pub fn new(generator: Box<dyn TextGenerator>, callbacks: CallbackManager) -> Self {
        Self::with_transport(generator, callbacks, NdjsonTransport::new())
    }
}

impl<W: Write> WorkerServer<W> {
    /// The generator must already be loaded: the ready notification is sent
    /// as soon as `run` starts.
    pub fn with_transport(
        generator: Box<dyn TextGenerator>,
        callbacks: CallbackManager,
        transport: NdjsonTransport<W>,
    ) -> Self {
        Self {
            generator,
            callbacks,
            transport,
            calls: 0,
        }
    }

    pub fn into_transport(self) -> NdjsonTransport<W> {
        self.transport
    }

    /// Announce readiness, then serve requests until `input` reaches EOF.
    pub fn run(&mut self, input: impl BufRead) -> std::io::Result<()> {
        self.announce_ready();

        for line in input.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.handle_line(trimmed);
        }

        tracing::info!(calls = self.calls, "Input closed, worker exiting");
        Ok(())
    }

    fn announce_ready(&mut self) {
        let ready = WorkerReady {
            pid: std::process::id(),
            backend: self.generator.name().to_string(),
        };
        match serde_json::to_value(&ready) {
            Ok(params) => self.transport.write_notification(NOTIFY_READY, params),
            Err(e) => tracing::error!("Failed to encode ready notification: {}", e),
        }
        tracing::info!(pid = ready.pid, backend = %ready.backend, "Worker ready");
    }

    pub fn handle_line(&mut self, line: &str) {
        let msg: JsonRpcIncoming = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Parse error: {}", e);
                self.transport.write_error(0, PARSE_ERROR, "Parse error: invalid JSON");
                return;
            }
        };

        let id = msg.id.unwrap_or(0);
        let Some(method) = msg.method else {
            return;
        };

        match method.as_str() {
            METHOD_GENERATE => self.handle_generate(id, msg.params),
            _ => {
                self.transport
                    .write_error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method));
            }
        }
    }

    fn handle_generate(&mut self, id: u64, params: Option<serde_json::Value>) {
        let params: GenerateParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                self.transport.write_error(id, INVALID_PARAMS, format!("Invalid params: {}", e));
                return;
            }
            None => {
                self.transport.write_error(id, INVALID_PARAMS, "Missing params");
                return;
            }
        };

        self.calls += 1;
        let component = Component::named(self.generator.name());
        self.callbacks.on_llm_start(&component, std::slice::from_ref(&params.prompt));

        let started_at_ms = epoch_ms();
        let callbacks = &self.callbacks;
        let outcome = self
            .generator
            .generate(&params.prompt, &mut |token| callbacks.on_llm_new_token(token));
        let finished_at_ms = epoch_ms();

        match outcome {
            Ok(result) => {
                tracing::debug!(call = self.calls, elapsed_ms = finished_at_ms - started_at_ms, "{}", result.full_text);
                self.callbacks.on_llm_end(&LlmResult {
                    generations: vec![result.full_text.clone()],
                    prompt_tokens: result.prompt_tokens,
                    completion_tokens: result.completion_tokens,
                });
                let output = GenerateOutput {
                    text: result.full_text,
                    prompt_tokens: result.prompt_tokens,
                    completion_tokens: result.completion_tokens,
                    worker_pid: std::process::id(),
                    call_index: self.calls,
                    started_at_ms,
                    finished_at_ms,
                };
                match serde_json::to_value(output) {
                    Ok(value) => self.transport.write_response(id, value),
                    Err(e) => self.transport.write_error(id, INFERENCE_ERROR, e.to_string()),
                }
            }
            Err(e) => {
                self.callbacks.on_llm_error(e.as_ref());
                self.transport.write_error(id, INFERENCE_ERROR, format!("{e:#}"));
            }
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
