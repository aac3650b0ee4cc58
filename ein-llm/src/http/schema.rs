use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub question: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexQuery {
    pub q: Option<String>,
}

/// Body of every `/chat` response: an answer or an error, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatReply {
    Answer { answer: String, status: u16 },
    Error { error: String, status: u16 },
}

impl ChatReply {
    pub fn answer(answer: impl Into<String>) -> Self {
        Self::Answer {
            answer: answer.into(),
            status: 200,
        }
    }

    pub fn error(error: impl Into<String>, status: u16) -> Self {
        Self::Error {
            error: error.into(),
            status,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Answer { status, .. } | Self::Error { status, .. } => *status,
        }
    }
}
