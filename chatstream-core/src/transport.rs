use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::Stream;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{EndpointCfg, HttpCfg};
use crate::error::{ChatStreamError, CoreResult};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::{CompletionRequest, CompletionResponse};

/// Raw response body of a streaming completion.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Opens completion requests against a server. The engine only needs the raw
/// event-stream bytes; SSE parsing happens downstream.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Issue a streaming request. Errors before the first byte (HTTP status,
    /// connect failures) are returned here rather than inside the stream.
    async fn open_stream(&self, req: &CompletionRequest) -> CoreResult<ByteStream>;

    /// Issue a non-streaming request.
    async fn complete(&self, req: &CompletionRequest) -> CoreResult<CompletionResponse>;
}

/// OpenAI-compatible `/v1/chat/completions` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    base: String,
    api_key: Option<SecretString>,
}

impl HttpTransport {
    pub fn new(http: HttpClient, base: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build from config; the API key is read from the configured environment
    /// variable and may be absent for local servers.
    pub fn from_config(endpoint: &EndpointCfg, http: &HttpCfg) -> CoreResult<Self> {
        let api_key = std::env::var(&endpoint.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            tracing::debug!(env = %endpoint.api_key_env, "no API key in environment");
        }
        Ok(Self::new(HttpClient::from_config(http)?, &endpoint.base_url, api_key))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            HttpClient::new_default().unwrap(),
            server_base,
            Some(SecretString::new("test-key".into())),
        )
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base)
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.api_key {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            ));
        }
        h
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    fn name(&self) -> &str {
        self.http.provider()
    }

    async fn open_stream(&self, req: &CompletionRequest) -> CoreResult<ByteStream> {
        if req.messages.is_empty() {
            return Err(ChatStreamError::Validation("request has no messages".into()));
        }
        let mut body = req.clone();
        body.stream = true;
        let headers = self.headers();
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
            message_id: req.message_id.as_deref(),
        };
        let (stream, server_request_id) = self
            .http
            .post_event_stream(&self.url(), &body, &header_refs, &ctx)
            .await?;
        tracing::debug!(model = %req.model, server_request_id = ?server_request_id, "event stream opened");
        Ok(stream)
    }

    async fn complete(&self, req: &CompletionRequest) -> CoreResult<CompletionResponse> {
        if req.messages.is_empty() {
            return Err(ChatStreamError::Validation("request has no messages".into()));
        }
        let mut body = req.clone();
        body.stream = false;
        let headers = self.headers();
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
            message_id: req.message_id.as_deref(),
        };
        let (resp, _server_request_id, latency_ms) = self
            .http
            .post_json::<_, CompletionResponse>(&self.url(), &body, &header_refs, &ctx)
            .await?;
        tracing::debug!(model = %req.model, latency_ms, "completion received");
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, Role};
    use futures_util::StreamExt;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn request() -> CompletionRequest {
        CompletionRequest::new("gpt-test", vec![ChatMessage::new(Role::User, "Hi")])
    }

    #[tokio::test]
    async fn open_stream_posts_streaming_body_with_auth() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("Authorization", "Bearer test-key")
                .json_body_partial(r#"{"model":"gpt-test","stream":true}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n");
        });
        let transport = HttpTransport::new_for_tests(&server.base_url());
        let mut stream = transport.open_stream(&request()).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert!(String::from_utf8(body).unwrap().ends_with("data: [DONE]\n\n"));
        m.assert();
    }

    #[tokio::test]
    async fn correlation_ids_travel_as_headers() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("X-Message-Id", "msg-42")
                .header("X-Request-Id", "req-42");
            then.status(200).body("data: [DONE]\n\n");
        });
        let mut req = request().for_message("msg-42");
        req.request_id = Some("req-42".into());
        HttpTransport::new_for_tests(&server.base_url())
            .open_stream(&req)
            .await
            .unwrap();
        m.assert();
    }

    #[tokio::test]
    async fn complete_decodes_message_and_usage() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .json_body_partial(r#"{"stream":false}"#);
            then.status(200).json_body(json!({
                "id": "cmpl-1",
                "choices": [{
                    "message": { "role": "assistant", "content": "Hello there", "reasoning_content": "greet" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 2 }
            }));
        });
        let transport = HttpTransport::new_for_tests(&format!("{}/", server.base_url()));
        let resp = transport.complete(&request()).await.unwrap();
        assert_eq!(resp.choices[0].message.content, "Hello there");
        assert_eq!(resp.choices[0].message.reasoning_content.as_deref(), Some("greet"));
        assert_eq!(resp.usage.unwrap().completion_tokens, 2);
        m.assert();
    }

    #[tokio::test]
    async fn unauthorized_maps_to_provider_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body(r#"{"error":"bad key"}"#);
        });
        let transport = HttpTransport::new_for_tests(&server.base_url());
        let err = transport.open_stream(&request()).await.err().unwrap();
        match err {
            ChatStreamError::ProviderError { code, message, .. } => {
                assert_eq!(code, "401");
                assert!(message.contains("bad key"));
            }
            other => panic!("expected ProviderError, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_request_is_rejected_locally() {
        let transport = HttpTransport::new_for_tests("http://127.0.0.1:9");
        let req = CompletionRequest::new("m", vec![]);
        assert!(matches!(
            transport.open_stream(&req).await.err(),
            Some(ChatStreamError::Validation(_))
        ));
    }
}
