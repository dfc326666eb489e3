//! Folds parsed SSE events into running content/reasoning/tool-call totals.

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::model::ToolCall;
use crate::sse::SseEvent;

// ---- Wire structs (chat.completion.chunk) ----
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<Delta>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkUsage {
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

/// Why an event did not change the totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoData,
    BadJson,
    NoChoices,
    NoDelta,
}

/// Running totals after one applied delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: Vec<ToolCall>,
    pub completion_tokens: u32,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Delta(Progress),
    Done,
    Skipped(SkipReason),
}

/// Tokens per second, with elapsed time floored at 0.1s and the result rounded
/// to two decimals.
pub fn calculate_speed(completion_tokens: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(0.1);
    (completion_tokens as f64 / secs * 100.0).round() / 100.0
}

/// Display form of a speed value; numbers stay numeric until they reach the UI.
pub fn format_speed(speed: f64) -> String {
    if speed.is_finite() && speed > 0.0 {
        format!("{speed:.2}")
    } else {
        "0".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct DeltaAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    completion_tokens: u32,
    started: Instant,
}

impl Default for DeltaAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::with_prefix("", "")
    }

    /// Seed with previously received text so new deltas splice onto it.
    pub fn with_prefix(content: &str, reasoning: &str) -> Self {
        Self {
            content: content.to_string(),
            reasoning: reasoning.to_string(),
            tool_calls: Vec::new(),
            completion_tokens: 0,
            started: Instant::now(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn completion_tokens(&self) -> u32 {
        self.completion_tokens
    }

    pub fn apply(&mut self, event: &SseEvent) -> Applied {
        let elapsed = self.started.elapsed();
        self.apply_at(event, elapsed)
    }

    /// Same as [`apply`](Self::apply) with an explicit elapsed time.
    pub fn apply_at(&mut self, event: &SseEvent, elapsed: Duration) -> Applied {
        let Some(data) = event.data.as_deref() else {
            return Applied::Skipped(SkipReason::NoData);
        };
        if event.is_done() {
            return Applied::Done;
        }
        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable chunk");
                return Applied::Skipped(SkipReason::BadJson);
            }
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Applied::Skipped(SkipReason::NoChoices);
        };
        let Some(delta) = choice.delta else {
            return Applied::Skipped(SkipReason::NoDelta);
        };

        if let Some(text) = delta.content {
            self.content.push_str(&text);
        }
        if let Some(text) = delta.reasoning_content {
            self.reasoning.push_str(&text);
        }
        if let Some(calls) = delta.tool_calls {
            self.tool_calls.extend(calls);
        }
        if let Some(tokens) = chunk.usage.and_then(|u| u.completion_tokens) {
            self.completion_tokens = tokens;
        }

        Applied::Delta(self.progress(elapsed))
    }

    pub fn progress(&self, elapsed: Duration) -> Progress {
        Progress {
            content: self.content.clone(),
            reasoning_content: self.reasoning.clone(),
            tool_calls: self.tool_calls.clone(),
            completion_tokens: self.completion_tokens,
            speed: calculate_speed(self.completion_tokens, elapsed),
        }
    }
}
