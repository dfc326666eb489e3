use serde::{Deserialize, Serialize};

use crate::model::StreamStatus;

/// One state-machine transition of a stream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTrace {
    pub message_id: String,
    /// Operation that caused the transition, e.g. "start", "pause", "error".
    pub transition: String,
    pub status: StreamStatus,
    pub content_len: usize,
    pub tokens_completion: u32,
    pub speed: f64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub at_ms: i64,
}

impl StreamTrace {
    pub fn new(message_id: impl Into<String>, transition: &str, status: StreamStatus) -> Self {
        Self {
            message_id: message_id.into(),
            transition: transition.to_string(),
            status,
            content_len: 0,
            tokens_completion: 0,
            speed: 0.0,
            error_kind: None,
            error_message: None,
            at_ms: crate::model::now_ms(),
        }
    }

    pub fn content_len(mut self, len: usize) -> Self {
        self.content_len = len;
        self
    }
    pub fn tokens(mut self, completion: u32, speed: f64) -> Self {
        self.tokens_completion = completion;
        self.speed = speed;
        self
    }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}

/// Summary emitted once when a stream reaches a terminal status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionLog {
    pub message_id: Option<String>,
    pub status: Option<StreamStatus>,
    pub started_at_ms: Option<i64>,
    pub latency_ms: Option<u64>,
    pub text: Option<String>,
    pub reasoning_len: Option<usize>,
    pub tokens_completion: Option<u32>,
    pub speed: Option<f64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl CompletionLog {
    pub fn new() -> Self { Self::default() }
    pub fn message_id(mut self, v: &str) -> Self { self.message_id = Some(v.to_string()); self }
    pub fn status(mut self, v: StreamStatus) -> Self { self.status = Some(v); self }
    pub fn started_at_ms(mut self, v: i64) -> Self { self.started_at_ms = Some(v); self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn text(mut self, v: &str) -> Self { self.text = Some(v.to_string()); self }
    pub fn reasoning_len(mut self, v: usize) -> Self { self.reasoning_len = Some(v); self }
    pub fn tokens(mut self, completion: u32, speed: f64) -> Self {
        self.tokens_completion = Some(completion); self.speed = Some(speed); self
    }
    pub fn error_kind_opt(mut self, v: Option<&str>) -> Self { self.error_kind = v.map(|s| s.to_string()); self }
    pub fn error_message_opt(mut self, v: Option<&str>) -> Self { self.error_message = v.map(|s| s.to_string()); self }
}
