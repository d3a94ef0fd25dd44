//! Relay configuration: TOML file (or legacy flat JSON) + CLI overrides.

use cqrelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use url::Url;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section: where framework connections are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub access_token: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            access_token: String::new(),
        }
    }
}

/// `[upstream]` section: the gateway to dial for every session.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_in_query: bool,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            access_token: String::new(),
            token_in_query: false,
        }
    }
}

/// `[upload]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: default_upload_timeout(),
        }
    }
}

/// `[relay]` section: per-session tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            close_timeout_ms: default_close_timeout(),
        }
    }
}

/// Flat JSON layout used by older deployments.
#[derive(Debug, Default, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    listen_http: String,
    #[serde(default)]
    listen_ws_path: String,
    #[serde(default)]
    upstream_ws_url: String,
    #[serde(default)]
    upstream_access_token: String,
    #[serde(default)]
    upstream_use_query_token: bool,
    #[serde(default)]
    server_access_token: String,
    #[serde(default)]
    upload_endpoint: String,
}

impl From<LegacyConfig> for ConfigFile {
    fn from(legacy: LegacyConfig) -> Self {
        let mut file = ConfigFile::default();
        if !legacy.listen_http.is_empty() {
            file.server.listen = if legacy.listen_http.starts_with(':') {
                format!("0.0.0.0{}", legacy.listen_http)
            } else {
                legacy.listen_http
            };
        }
        if !legacy.listen_ws_path.is_empty() {
            file.server.path = legacy.listen_ws_path;
        }
        file.server.access_token = legacy.server_access_token;
        if !legacy.upstream_ws_url.is_empty() {
            file.upstream.url = legacy.upstream_ws_url;
        }
        file.upstream.access_token = legacy.upstream_access_token;
        file.upstream.token_in_query = legacy.upstream_use_query_token;
        file.upload.endpoint = legacy.upload_endpoint;
        file
    }
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_path() -> String {
    "/ws".to_string()
}
fn default_upstream_url() -> String {
    "ws://127.0.0.1:6700".to_string()
}
fn default_upload_timeout() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    64
}
fn default_close_timeout() -> u64 {
    1000
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub path: Option<String>,
    pub upstream: Option<String>,
    pub upload_endpoint: Option<String>,
}

/// How the upstream token travels on the dial request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    Header,
    Query,
}

/// Resolved relay configuration (validated, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub path: String,
    /// Required bearer token for framework connections.
    pub access_token: Option<String>,
    pub upstream_url: Url,
    pub upstream_token: Option<String>,
    pub token_placement: TokenPlacement,
    pub upload_endpoint: Option<String>,
    pub upload_timeout: Duration,
    pub queue_capacity: usize,
    pub close_timeout: Duration,
}

impl RelayConfig {
    /// Load config from file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&expanded, &content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file_config, cli)
    }

    /// Merge overrides into a parsed file and validate.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> RelayResult<Self> {
        let listen_str = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid listen address {listen_str}: {e}")))?;

        let path = cli.path.unwrap_or(file.server.path);
        if !path.starts_with('/') {
            return Err(RelayError::Config(format!("listen path must start with '/': {path}")));
        }

        let upstream_str = cli.upstream.unwrap_or(file.upstream.url);
        let upstream_url = Url::parse(&upstream_str)?;
        if !matches!(upstream_url.scheme(), "ws" | "wss") {
            return Err(RelayError::Config(format!(
                "upstream url must use ws:// or wss://: {upstream_str}"
            )));
        }

        if file.relay.queue_capacity == 0 {
            return Err(RelayError::Config("relay.queue_capacity must be at least 1".into()));
        }

        let upload_endpoint = cli.upload_endpoint.unwrap_or(file.upload.endpoint);

        Ok(Self {
            listen,
            path,
            access_token: non_empty(file.server.access_token),
            upstream_url,
            upstream_token: non_empty(file.upstream.access_token),
            token_placement: if file.upstream.token_in_query {
                TokenPlacement::Query
            } else {
                TokenPlacement::Header
            },
            upload_endpoint: non_empty(upload_endpoint),
            upload_timeout: Duration::from_secs(file.upload.timeout_secs),
            queue_capacity: file.relay.queue_capacity,
            close_timeout: Duration::from_millis(file.relay.close_timeout_ms),
        })
    }
}

fn parse_config(path: &Path, content: &str) -> RelayResult<ConfigFile> {
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        serde_json::from_str::<LegacyConfig>(content)
            .map(ConfigFile::from)
            .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    } else {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
