//! Glue between request handlers and the worker pool.

use std::sync::Arc;

use serde_json::json;

use crate::error::EngineError;
use crate::hooks::{CallbackManager, Component};
use crate::pool::{Job, JobOutput, WorkerPool};

/// A validated, non-empty question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question(String);

impl Question {
    pub fn parse(text: impl Into<String>) -> Result<Self, EngineError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(EngineError::Validation("question must not be empty".into()));
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The answer to one question, with where and how it was computed.
#[derive(Debug, Clone)]
pub struct Answer {
    pub output: JobOutput,
}

impl Answer {
    pub fn text(&self) -> &str {
        &self.output.text
    }

    pub fn into_text(self) -> String {
        self.output.text
    }
}

#[derive(Clone)]
pub struct ExecutionBridge {
    pool: Arc<WorkerPool>,
    callbacks: Arc<CallbackManager>,
}

impl ExecutionBridge {
    pub fn new(pool: Arc<WorkerPool>, callbacks: Arc<CallbackManager>) -> Self {
        Self { pool, callbacks }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Hand the question to the pool and wait for exactly one result.
    ///
    /// Suspends only the calling task. Dropping the returned future cancels
    /// the job.
    pub async fn answer(&self, question: &Question) -> Result<Answer, EngineError> {
        let component = Component::named("chat");
        self.callbacks
            .on_chain_start(&component, &json!({ "question": question.as_str() }));

        let outcome = match self.pool.submit(Job::generate(question.as_str())) {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => {
                self.callbacks.on_chain_end(&json!({
                    "answer": output.text,
                    "workerPid": output.worker_pid,
                    "callIndex": output.call_index,
                }));
                Ok(Answer { output })
            }
            Err(e) => {
                tracing::error!(code = e.code(), "Question failed: {}", e);
                self.callbacks.on_chain_error(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_rejects_blank_text() {
        assert!(matches!(Question::parse(""), Err(EngineError::Validation(_))));
        assert!(matches!(Question::parse(" \n\t"), Err(EngineError::Validation(_))));
    }

    #[test]
    fn question_keeps_text_verbatim() {
        let q = Question::parse("  What is 2+2? ").unwrap();
        assert_eq!(q.as_str(), "  What is 2+2? ");
    }
}
