use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Lifecycle status of one generation. There is no idle state: a record is
/// born `Streaming`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Streaming,
    Paused,
    Completed,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One tool-call fragment as streamed by the server. Streaming fragments
/// usually carry only some of these fields, so all of them are optional.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
        }
    }
}

/// Completion request handed to the transport collaborator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Client-side correlation id, sent as `X-Request-Id`; never part of the body.
    #[serde(skip)]
    pub request_id: Option<String>,
    /// Message the answer is written to, sent as `X-Message-Id`; never part of the body.
    #[serde(skip)]
    pub message_id: Option<String>,
}

fn default_stream() -> bool {
    true
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            max_tokens: None,
            temperature: None,
            top_p: None,
            request_id: None,
            message_id: None,
        }
    }

    pub fn for_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Build the request that continues an interrupted generation: the text
    /// already received is appended as a trailing assistant turn so the server
    /// continues from it instead of starting over.
    pub fn continuation(&self, prefix_content: &str, prefix_reasoning: &str) -> Self {
        let mut next = self.clone();
        if prefix_content.is_empty() && prefix_reasoning.is_empty() {
            return next;
        }
        next.messages.push(ChatMessage {
            role: Role::Assistant,
            content: prefix_content.to_string(),
            reasoning_content: (!prefix_reasoning.is_empty()).then(|| prefix_reasoning.to_string()),
        });
        next
    }
}

/// Non-streaming completion body (`choices[0].message` + `usage`).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct CompletionUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Partial update pushed into the message store. `None` fields are left as-is.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub completion_tokens: Option<u32>,
    pub speed: Option<f64>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub error: Option<String>,
}

/// Message entity as owned by the chat store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Option<Role>,
    pub content: String,
    pub reasoning_content: String,
    pub completion_tokens: u32,
    pub speed: f64,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

impl Message {
    pub fn apply(&mut self, update: MessageUpdate) {
        if let Some(content) = update.content {
            self.content = content;
        }
        if let Some(reasoning) = update.reasoning_content {
            self.reasoning_content = reasoning;
        }
        if let Some(tokens) = update.completion_tokens {
            self.completion_tokens = tokens;
        }
        if let Some(speed) = update.speed {
            self.speed = speed;
        }
        if let Some(calls) = update.tool_calls {
            self.tool_calls = calls;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
