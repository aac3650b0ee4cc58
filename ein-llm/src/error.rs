use thiserror::Error;

/// Typed error variants for the ein-llm server and its workers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Worker {slot} died: {detail}")]
    WorkerDied { slot: usize, detail: String },

    #[error("Worker {slot} timed out after {elapsed_ms} ms")]
    WorkerTimeout { slot: usize, elapsed_ms: u64 },

    #[error("No live workers available")]
    NoWorkers,

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Worker failed to start: {0}")]
    WorkerSpawn(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Return a machine-readable error code string for this error variant.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Inference(_) => "INFERENCE_ERROR",
            Self::WorkerDied { .. } => "WORKER_DIED",
            Self::WorkerTimeout { .. } => "WORKER_TIMEOUT",
            Self::NoWorkers => "NO_WORKERS",
            Self::PoolClosed => "POOL_CLOSED",
            Self::WorkerSpawn(_) => "WORKER_SPAWN_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Whether this failure means the worker process that produced it can no
    /// longer be trusted and has to be replaced.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            Self::WorkerDied { .. } | Self::WorkerTimeout { .. } | Self::Protocol(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_variant() {
        let errors = [
            EngineError::Validation("x".into()),
            EngineError::Inference("x".into()),
            EngineError::WorkerDied { slot: 0, detail: "x".into() },
            EngineError::WorkerTimeout { slot: 0, elapsed_ms: 1 },
            EngineError::NoWorkers,
            EngineError::PoolClosed,
            EngineError::WorkerSpawn("x".into()),
            EngineError::Protocol("x".into()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn inference_error_preserves_message() {
        let err = EngineError::Inference("tensor shape mismatch".into());
        assert_eq!(err.to_string(), "Inference error: tensor shape mismatch");
    }

    #[test]
    fn worker_fatal_classification() {
        assert!(EngineError::WorkerDied { slot: 1, detail: "eof".into() }.is_worker_fatal());
        assert!(EngineError::WorkerTimeout { slot: 1, elapsed_ms: 10 }.is_worker_fatal());
        assert!(EngineError::Protocol("garbage".into()).is_worker_fatal());
        assert!(!EngineError::Inference("bad prompt".into()).is_worker_fatal());
        assert!(!EngineError::Validation("empty".into()).is_worker_fatal());
    }
}
