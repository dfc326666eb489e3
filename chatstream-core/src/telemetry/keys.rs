/// Span/log attribute keys for stream ingestion.
/// Keep these stable; log queries match on them.
pub const KEY_MESSAGE_ID: &str = "stream.message_id";
pub const KEY_STREAM_ID: &str = "stream.id";
pub const KEY_STATUS: &str = "stream.status";
pub const KEY_TRANSITION: &str = "stream.transition";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_REQUEST_ID: &str = "req.id";

pub const KEY_CONTENT_LEN: &str = "content.len";
pub const KEY_TOKENS_COMPLETION: &str = "tokens.completion";
pub const KEY_SPEED: &str = "tokens.per_sec";
pub const KEY_LATENCY_MS: &str = "latency.ms";

pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
