//! Server configuration: TOML file + CLI overrides.

use asr_core::{AsrError, AsrResult, Compression};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::bridge::BridgeConfig;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    pub cert: Option<String>,
    pub key: Option<String>,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_queue_depth")]
    pub upstream_queue_depth: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            cert: None,
            key: None,
            stop_grace_ms: default_stop_grace_ms(),
            connect_timeout_secs: default_connect_timeout(),
            upstream_queue_depth: default_queue_depth(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// `[upstream]` section: recognition endpoint and credentials.
///
/// `appid`, `token` and `cluster` are the legacy spellings of `app_id`,
/// `access_key` and `resource_id`; see [`crate::settings`] for precedence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamSection {
    pub endpoint: Option<String>,
    pub resource_id: Option<String>,
    pub app_id: Option<String>,
    pub access_key: Option<String>,
    pub app_key: Option<String>,
    pub compression: Option<String>,
    pub model_name: Option<String>,
    pub refresh_secs: Option<u64>,
    #[serde(rename = "appid")]
    pub legacy_app_id: Option<String>,
    #[serde(rename = "token")]
    pub legacy_access_key: Option<String>,
    #[serde(rename = "cluster")]
    pub legacy_resource_id: Option<String>,
}

/// `[auth]` section: how client connections are identified.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for signed tokens.
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Fixed tokens, mostly for development.
    #[serde(default)]
    pub static_tokens: HashMap<String, StaticTokenEntry>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
            static_tokens: HashMap::new(),
        }
    }
}

/// One entry of `[auth.static_tokens]`.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticTokenEntry {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_path() -> String {
    "/asr".to_string()
}
fn default_stop_grace_ms() -> u64 {
    1500
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_queue_depth() -> usize {
    64
}
fn default_max_frame_bytes() -> usize {
    1_048_576
}
fn default_token_ttl() -> u64 {
    86400
}
fn default_role() -> String {
    "user".to_string()
}

/// Parse a compression name from config.
pub fn parse_compression(name: Option<&str>) -> AsrResult<Compression> {
    match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
        None | Some("gzip") => Ok(Compression::Gzip),
        Some("none") | Some("") => Ok(Compression::None),
        Some(other) => Err(AsrError::Config(format!("unknown compression: {other}"))),
    }
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// WebSocket path; empty accepts any path.
    pub path: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub stop_grace: Duration,
    pub connect_timeout: Duration,
    pub upstream_queue_depth: usize,
    pub max_frame_bytes: usize,
    pub upstream: UpstreamSection,
    pub auth: AuthSection,
    /// File the config was read from, if it existed.
    pub source: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
    ) -> AsrResult<Self> {
        let (file_config, source) = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                match read_config_file(&expanded)? {
                    Some(cfg) => {
                        info!(path = %expanded.display(), "loaded config file");
                        (cfg, Some(expanded))
                    }
                    None => {
                        info!(path = %expanded.display(), "config file not found, using defaults");
                        (ConfigFile::default(), None)
                    }
                }
            }
            None => (ConfigFile::default(), None),
        };

        // Validate early so a typo fails at startup, not on the first session.
        parse_compression(file_config.upstream.compression.as_deref())?;

        let server = file_config.server;
        let cert = cli_cert.map(str::to_string).or(server.cert);
        let key = cli_key.map(str::to_string).or(server.key);
        if cert.is_some() != key.is_some() {
            return Err(AsrError::Config(
                "both cert and key are required to enable TLS".into(),
            ));
        }

        Ok(Self {
            host: cli_host.map(str::to_string).unwrap_or(server.host),
            port: cli_port.unwrap_or(server.port),
            path: server.path,
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            stop_grace: Duration::from_millis(server.stop_grace_ms),
            connect_timeout: Duration::from_secs(server.connect_timeout_secs.max(1)),
            upstream_queue_depth: server.upstream_queue_depth.max(1),
            max_frame_bytes: server.max_frame_bytes,
            upstream: file_config.upstream,
            auth: file_config.auth,
            source,
        })
    }

    /// Per-connection settings handed to every session bridge.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            stop_grace: self.stop_grace,
            connect_timeout: self.connect_timeout,
            upstream_queue_depth: self.upstream_queue_depth,
        }
    }
}

/// Read and parse a config file. `Ok(None)` when it does not exist.
pub fn read_config_file(path: &Path) -> AsrResult<Option<ConfigFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    toml::from_str::<ConfigFile>(&content)
        .map(Some)
        .map_err(|e| AsrError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
