use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::ListQuery;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// Relative paths of the backend collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub resources: String,
    pub tasks: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            resources: "vms".to_string(),
            tasks: "tasks".to_string(),
        }
    }
}

/// Poll periods per consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCadence {
    pub list: Duration,
    pub detail_live: Duration,
    pub detail_normal: Duration,
}

impl Default for PollCadence {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(10),
            detail_live: Duration::from_secs(3),
            detail_normal: Duration::from_secs(15),
        }
    }
}

impl PollCadence {
    pub fn detail(&self, live_mode: bool) -> Duration {
        if live_mode {
            self.detail_live
        } else {
            self.detail_normal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub base_url: String,
    pub endpoints: Endpoints,
    pub cadence: PollCadence,
    pub action_timeout: Duration,
    pub task_interval: Duration,
    pub task_backoff: Duration,
    pub request_timeout: Duration,
    pub page_limit: Option<u32>,
    pub settings_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoints: Endpoints::default(),
            cadence: PollCadence::default(),
            action_timeout: Duration::from_secs(10),
            task_interval: Duration::from_secs(2),
            task_backoff: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            page_limit: None,
            settings_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source. Unparseable or zero
    /// durations keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let base_url = lookup("VMSYNC_BASE_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(defaults.base_url);

        let cadence = PollCadence {
            list: secs(&lookup, "VMSYNC_LIST_INTERVAL_SECS", defaults.cadence.list),
            detail_live: secs(
                &lookup,
                "VMSYNC_DETAIL_LIVE_INTERVAL_SECS",
                defaults.cadence.detail_live,
            ),
            detail_normal: secs(
                &lookup,
                "VMSYNC_DETAIL_INTERVAL_SECS",
                defaults.cadence.detail_normal,
            ),
        };

        let page_limit = lookup("VMSYNC_PAGE_LIMIT").and_then(|raw| match raw.trim().parse::<u32>() {
            Ok(limit) if limit > 0 => Some(limit),
            _ => {
                warn!(value = %raw, "Ignoring invalid VMSYNC_PAGE_LIMIT");
                None
            }
        });

        Self {
            base_url,
            endpoints: Endpoints::default(),
            cadence,
            action_timeout: secs(&lookup, "VMSYNC_ACTION_TIMEOUT_SECS", defaults.action_timeout),
            task_interval: secs(&lookup, "VMSYNC_TASK_INTERVAL_SECS", defaults.task_interval),
            task_backoff: secs(&lookup, "VMSYNC_TASK_BACKOFF_SECS", defaults.task_backoff),
            request_timeout: secs(&lookup, "VMSYNC_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            page_limit,
            settings_path: lookup("VMSYNC_SETTINGS_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "base url must be http(s): {}",
                self.base_url
            )));
        }

        let periods = [
            self.cadence.list,
            self.cadence.detail_live,
            self.cadence.detail_normal,
            self.action_timeout,
            self.task_interval,
            self.task_backoff,
        ];
        if periods.iter().any(Duration::is_zero) {
            return Err(SyncError::Config("poll periods must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn list_query(&self) -> ListQuery {
        ListQuery {
            limit: self.page_limit,
            ..ListQuery::default()
        }
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if value > 0 => Duration::from_secs(value),
            _ => {
                warn!(key, value = %raw, "Invalid duration, using default");
                default
            }
        },
    }
}

/// User preferences that survive across sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub live_mode: bool,
}

/// Persisted settings with change notification.
///
/// Reads never touch the disk after `load`; every write goes through to the
/// backing file (when there is one) before subscribers are notified.
#[derive(Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    tx: Arc<watch::Sender<Settings>>,
}

impl SettingsStore {
    pub fn in_memory() -> Self {
        let (tx, _rx) = watch::channel(Settings::default());
        Self {
            path: None,
            tx: Arc::new(tx),
        }
    }

    /// Opens the store at `path`. A missing file means default settings.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::Storage(format!("reading {}: {e}", path.display())))?;
            serde_json::from_str(&raw)
                .map_err(|e| SyncError::Storage(format!("parsing {}: {e}", path.display())))?
        } else {
            debug!(path = %path.display(), "No settings file, using defaults");
            Settings::default()
        };

        let (tx, _rx) = watch::channel(settings);
        Ok(Self {
            path: Some(path),
            tx: Arc::new(tx),
        })
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        match &config.settings_path {
            Some(path) => Self::load(path),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn get(&self) -> Settings {
        *self.tx.borrow()
    }

    pub fn live_mode(&self) -> bool {
        self.get().live_mode
    }

    pub fn set_live_mode(&self, live_mode: bool) -> SyncResult<()> {
        let next = Settings { live_mode };
        self.persist(&next)?;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    fn persist(&self, settings: &Settings) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SyncError::Storage(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }

        let raw = serde_json::to_string_pretty(settings)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| SyncError::Storage(format!("writing {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| SyncError::Storage(format!("replacing {}: {e}", path.display())))?;
        Ok(())
    }
}
