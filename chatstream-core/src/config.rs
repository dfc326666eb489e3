use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::persistence::STREAM_STATE_PREFIX;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointCfg {
    /// Base URL of an OpenAI-compatible API, without the `/v1/...` path.
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    pub api_key_env: String,
    /// Model used when the caller does not pick one.
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    Off,
    Commit,
    Always,
}

fn default_fsync() -> FsyncPolicy {
    FsyncPolicy::Commit
}
fn default_key_prefix() -> String {
    STREAM_STATE_PREFIX.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PersistenceCfg {
    /// Snapshot directory. `None` keeps snapshots in memory only.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_fsync")]
    pub fsync: FsyncPolicy,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for PersistenceCfg {
    fn default() -> Self {
        Self {
            dir: None,
            fsync: default_fsync(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RenderCfg {
    /// Minimum spacing between two UI renders while streaming (default 200ms)
    #[serde(default = "default_render_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            interval_ms: default_render_interval_ms(),
        }
    }
}

impl RenderCfg {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_render_interval_ms() -> u64 {
    200
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamsCfg {
    /// How long a completed record stays readable before removal (default 5000ms)
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,
}

impl Default for StreamsCfg {
    fn default() -> Self {
        Self {
            cleanup_grace_ms: default_cleanup_grace_ms(),
        }
    }
}

impl StreamsCfg {
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }
}

fn default_cleanup_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds. Long generations need a generous
    /// value; `None` disables it (default 300000ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> Option<u64> {
    Some(300_000)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: EndpointCfg,
    #[serde(default)]
    pub persistence: PersistenceCfg,
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub streams: StreamsCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::ChatStreamError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::ChatStreamError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::error::CoreResult<()> {
        if self.render.interval_ms == 0 {
            return Err(crate::error::ChatStreamError::Validation(
                "render.interval_ms must be positive".into(),
            ));
        }
        if self.endpoint.base_url.trim().is_empty() {
            return Err(crate::error::ChatStreamError::Validation(
                "endpoint.base_url is empty".into(),
            ));
        }
        Ok(())
    }

    /// Configuration for a local OpenAI-compatible server with in-memory snapshots.
    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointCfg {
                base_url: base_url.into(),
                api_key_env: "OPENAI_API_KEY".into(),
                model: model.into(),
            },
            persistence: PersistenceCfg::default(),
            render: RenderCfg::default(),
            streams: StreamsCfg::default(),
            http: HttpCfg::default(),
        }
    }
}
