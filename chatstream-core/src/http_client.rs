use std::time::{Duration, Instant};

use futures_util::stream::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::HttpCfg;
use crate::error::{ChatStreamError, CoreResult};
use crate::transport::ByteStream;

/// Correlation ids sent as headers with each request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
    pub message_id: Option<&'a str>,
}

/// reqwest client configured from [`HttpCfg`], shared by the transports.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    /// Label used in mapped errors and telemetry.
    provider: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_config(&HttpCfg::default())
    }

    pub fn from_config(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatStreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "chatstream/0.1".to_string(),
            provider: "http".to_string(),
        })
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        if let Some(mid) = ctx.message_id {
            req = req.header("X-Message-Id", mid);
        }
        req
    }

    /// POST JSON and decode a JSON response. Returns the body, the server's
    /// request id if any, and the latency in milliseconds.
    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let resp = self
            .request(url, body, headers, ctx)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, url, "request failed before a response");
                ChatStreamError::ProviderUnavailable {
                    provider: self.provider.clone(),
                }
            })?;

        let elapsed_ms = start.elapsed().as_millis() as u32;
        let resp = self.check_status(resp).await?;
        let server_id = extract_request_id(resp.headers());
        let code = resp.status().as_u16().to_string();
        let decoded = resp.json::<R>().await.map_err(|e| ChatStreamError::ProviderError {
            provider: self.provider.clone(),
            code,
            message: format!("json decode error: {e}"),
        })?;
        Ok((decoded, server_id, elapsed_ms))
    }

    /// POST JSON and return the raw `text/event-stream` body as a byte stream.
    /// Non-2xx responses are mapped to errors before any byte is yielded.
    pub async fn post_event_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(ByteStream, Option<String>)> {
        let resp = self
            .request(url, body, headers, ctx)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, url, "stream request failed before a response");
                ChatStreamError::ProviderUnavailable {
                    provider: self.provider.clone(),
                }
            })?;

        let resp = self.check_status(resp).await?;
        let server_id = extract_request_id(resp.headers());
        let bytes = resp.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        Ok((Box::pin(bytes), server_id))
    }

    // Non-2xx responses are consumed here and turned into errors.
    async fn check_status(&self, resp: reqwest::Response) -> CoreResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(provider = %self.provider, status = status.as_u16(), "non-success response");
        Err(map_http_error(&self.provider, status, retry_after, &body))
    }
}

const REQUEST_ID_HEADERS: [&str; 3] = ["x-request-id", "request-id", "openai-request-id"];

pub(crate) fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| headers.get(*name)?.to_str().ok())
        .map(str::to_string)
}

// Only the delay-seconds form; HTTP dates yield None.
fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers.get("retry-after")?.to_str().ok()?.trim().parse().ok()
}

fn map_http_error(provider: &str, status: StatusCode, retry_after: Option<u64>, body: &str) -> ChatStreamError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChatStreamError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => ChatStreamError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => ChatStreamError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: clip_body(body, MAX_ERROR_BODY),
        },
    }
}

const MAX_ERROR_BODY: usize = 300;

fn clip_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let cut = (0..=max).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
    format!("{}...", &body[..cut])
}
