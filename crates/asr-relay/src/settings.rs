//! Upstream credentials and endpoint resolution.
//!
//! Each field is resolved independently, first match wins:
//!
//! 1. environment (`ASR_APP_ID`, `ASR_ACCESS_KEY`, `ASR_APP_KEY`,
//!    `ASR_RESOURCE_ID`, `ASR_ENDPOINT`)
//! 2. current config keys (`app_id`, `access_key`, `resource_id`, ...)
//! 3. legacy config keys (`appid`, `token`, `cluster`)
//! 4. built-in defaults (endpoint and resource id only)
//!
//! Sessions read from a [`CredentialsCache`] that can be refreshed while the
//! server runs, so rotated keys apply to the next `start`.

use asr_core::{AsrError, AsrResult, Compression};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{parse_compression, read_config_file, UpstreamSection};

pub const DEFAULT_ENDPOINT: &str = "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel";
pub const DEFAULT_RESOURCE_ID: &str = "volc.bigasr.sauc.duration";
pub const DEFAULT_MODEL_NAME: &str = "bigmodel";

pub const ENV_APP_ID: &str = "ASR_APP_ID";
pub const ENV_ACCESS_KEY: &str = "ASR_ACCESS_KEY";
pub const ENV_APP_KEY: &str = "ASR_APP_KEY";
pub const ENV_RESOURCE_ID: &str = "ASR_RESOURCE_ID";
pub const ENV_ENDPOINT: &str = "ASR_ENDPOINT";

/// Everything needed to open one upstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub endpoint: String,
    pub app_id: String,
    pub access_key: String,
    pub app_key: Option<String>,
    pub resource_id: String,
    pub compression: Compression,
    pub model_name: String,
}

/// Source of upstream settings for new sessions.
pub trait SettingsProvider: Send + Sync {
    /// Errors with [`AsrError::Config`] when credentials are missing.
    fn upstream_settings(&self) -> AsrResult<UpstreamSettings>;
}

/// Resolve settings from a config section and an environment lookup.
///
/// Returns `None` when app id or access key is missing.
pub fn resolve_settings(
    section: &UpstreamSection,
    env: impl Fn(&str) -> Option<String>,
) -> Option<UpstreamSettings> {
    let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());
    let pick = |values: [Option<&String>; 2]| {
        values
            .into_iter()
            .flatten()
            .find(|v| !v.trim().is_empty())
            .cloned()
    };

    let app_id = env(ENV_APP_ID).or_else(|| {
        pick([section.app_id.as_ref(), section.legacy_app_id.as_ref()])
    })?;
    let access_key = env(ENV_ACCESS_KEY).or_else(|| {
        pick([section.access_key.as_ref(), section.legacy_access_key.as_ref()])
    })?;
    let resource_id = env(ENV_RESOURCE_ID)
        .or_else(|| pick([section.resource_id.as_ref(), section.legacy_resource_id.as_ref()]))
        .unwrap_or_else(|| DEFAULT_RESOURCE_ID.to_string());
    let endpoint = env(ENV_ENDPOINT)
        .or_else(|| pick([section.endpoint.as_ref(), None]))
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let app_key = env(ENV_APP_KEY).or_else(|| pick([section.app_key.as_ref(), None]));

    let compression = match parse_compression(section.compression.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "falling back to gzip");
            Compression::Gzip
        }
    };

    Some(UpstreamSettings {
        endpoint,
        app_id,
        access_key,
        app_key,
        resource_id,
        compression,
        model_name: section
            .model_name
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
    })
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Last resolved settings, refreshable from the config file and environment.
pub struct CredentialsCache {
    current: RwLock<Option<UpstreamSettings>>,
    section: RwLock<UpstreamSection>,
    config_path: Option<PathBuf>,
}

impl CredentialsCache {
    pub fn new(section: UpstreamSection, config_path: Option<PathBuf>) -> Self {
        let resolved = resolve_settings(&section, process_env);
        if resolved.is_none() {
            warn!("upstream credentials are not configured; sessions will fail to start");
        }
        Self {
            current: RwLock::new(resolved),
            section: RwLock::new(section),
            config_path,
        }
    }

    /// Fixed settings, no file or environment involved.
    #[cfg(test)]
    pub fn fixed(settings: UpstreamSettings) -> Self {
        Self {
            current: RwLock::new(Some(settings)),
            section: RwLock::new(UpstreamSection::default()),
            config_path: None,
        }
    }

    /// Re-read the config file (if any) and environment. Returns whether
    /// credentials are now available.
    pub fn refresh(&self) -> bool {
        if let Some(path) = &self.config_path {
            match read_config_file(path) {
                Ok(Some(file)) => {
                    if let Ok(mut section) = self.section.write() {
                        *section = file.upstream;
                    }
                }
                Ok(None) => debug!(path = %path.display(), "config file gone, keeping last section"),
                Err(e) => warn!(path = %path.display(), error = %e, "config reload failed"),
            }
        }

        let resolved = match self.section.read() {
            Ok(section) => resolve_settings(&section, process_env),
            Err(_) => return false,
        };
        let available = resolved.is_some();
        if let Ok(mut current) = self.current.write() {
            if *current != resolved {
                info!(available, "upstream credentials changed");
            }
            *current = resolved;
        }
        available
    }

    /// Refresh on a fixed interval until the handle is aborted.
    pub fn spawn_refresh(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.refresh();
            }
        })
    }
}

impl SettingsProvider for CredentialsCache {
    fn upstream_settings(&self) -> AsrResult<UpstreamSettings> {
        self.current
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or_else(|| AsrError::Config("ASR credentials are not configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_credentials() {
        assert!(resolve_settings(&UpstreamSection::default(), env_of(&[])).is_none());

        let only_id = UpstreamSection {
            app_id: Some("a".into()),
            ..Default::default()
        };
        assert!(resolve_settings(&only_id, env_of(&[])).is_none());
    }

    #[test]
    fn defaults_fill_endpoint_and_resource() {
        let section = UpstreamSection {
            app_id: Some("a".into()),
            access_key: Some("k".into()),
            ..Default::default()
        };
        let s = resolve_settings(&section, env_of(&[])).unwrap();
        assert_eq!(s.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(s.resource_id, DEFAULT_RESOURCE_ID);
        assert_eq!(s.compression, Compression::Gzip);
        assert_eq!(s.model_name, DEFAULT_MODEL_NAME);
        assert!(s.app_key.is_none());
    }

    #[test]
    fn precedence_env_then_current_then_legacy() {
        let section = UpstreamSection {
            app_id: Some("current-app".into()),
            legacy_app_id: Some("legacy-app".into()),
            legacy_access_key: Some("legacy-token".into()),
            legacy_resource_id: Some("legacy-cluster".into()),
            ..Default::default()
        };

        let s = resolve_settings(&section, env_of(&[])).unwrap();
        assert_eq!(s.app_id, "current-app");
        assert_eq!(s.access_key, "legacy-token");
        assert_eq!(s.resource_id, "legacy-cluster");

        let s = resolve_settings(
            &section,
            env_of(&[(ENV_APP_ID, "env-app"), (ENV_ENDPOINT, "wss://example.test/asr")]),
        )
        .unwrap();
        assert_eq!(s.app_id, "env-app");
        assert_eq!(s.endpoint, "wss://example.test/asr");
    }

    #[test]
    fn blank_values_are_skipped() {
        let section = UpstreamSection {
            app_id: Some("  ".into()),
            legacy_app_id: Some("legacy".into()),
            access_key: Some("k".into()),
            ..Default::default()
        };
        let s = resolve_settings(&section, env_of(&[(ENV_APP_ID, "")])).unwrap();
        assert_eq!(s.app_id, "legacy");
    }

    #[test]
    fn cache_reports_missing_credentials() {
        let cache = CredentialsCache {
            current: RwLock::new(None),
            section: RwLock::new(UpstreamSection::default()),
            config_path: None,
        };
        let err = cache.upstream_settings().unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn cache_refresh_picks_up_file_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[upstream]\n").unwrap();

        let cache = CredentialsCache {
            current: RwLock::new(None),
            section: RwLock::new(UpstreamSection::default()),
            config_path: Some(file.path().to_path_buf()),
        };
        assert!(cache.upstream_settings().is_err());

        std::fs::write(
            file.path(),
            "[upstream]\napp_id = \"rotated-app\"\naccess_key = \"rotated-key\"\n",
        )
        .unwrap();
        // A process-level ASR_APP_ID would override the file; only assert
        // what the file controls when the environment is clean.
        if std::env::var(ENV_APP_ID).is_err() && std::env::var(ENV_ACCESS_KEY).is_err() {
            assert!(cache.refresh());
            assert_eq!(cache.upstream_settings().unwrap().app_id, "rotated-app");
        }
    }
}
