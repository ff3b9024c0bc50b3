//! Runtime settings.
//!
//! Read from a JSON file: the `--config` path if given, else the path in
//! `MADX_MODEL_CONFIG`, else `madx_model.json` in the working directory if it
//! exists. Missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::model::ModelOptions;
use crate::store::StoreConfig;
use crate::worker::process_manager::{WorkerMode, DEFAULT_TEARDOWN_TIMEOUT};
use crate::worker::worker_main::DEFAULT_POLL_INTERVAL;

pub const CONFIG_ENV: &str = "MADX_MODEL_CONFIG";
pub const CONFIG_FILE: &str = "madx_model.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    #[default]
    Process,
    Thread,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub isolation: Isolation,
    /// Worker executable for process isolation; this binary when unset.
    pub program: Option<PathBuf>,
    pub poll_interval_secs: f64,
    pub teardown_timeout_secs: f64,
    pub reply_timeout_secs: Option<f64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            program: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs_f64(),
            teardown_timeout_secs: DEFAULT_TEARDOWN_TIMEOUT.as_secs_f64(),
            reply_timeout_secs: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub worker: WorkerSettings,
    pub log: LogSettings,
}

impl Settings {
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(CONFIG_FILE);
                local.is_file().then_some(local)
            });
        match path {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn worker_mode(&self) -> WorkerMode {
        match self.worker.isolation {
            Isolation::Process => WorkerMode::Process {
                program: self.worker.program.clone(),
                engine: self.engine.clone(),
            },
            Isolation::Thread => WorkerMode::Thread {
                engine: self.engine.clone().into_factory(),
            },
        }
    }

    pub fn model_options(&self, optics: Option<String>, history: Option<PathBuf>) -> ModelOptions {
        ModelOptions {
            optics,
            history,
            worker: self.worker_mode(),
            poll_interval: seconds(self.worker.poll_interval_secs, DEFAULT_POLL_INTERVAL),
            teardown_timeout: seconds(self.worker.teardown_timeout_secs, DEFAULT_TEARDOWN_TIMEOUT),
            reply_timeout: self
                .worker
                .reply_timeout_secs
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        }
    }
}

/// Negative or non-finite values fall back to `default`.
fn seconds(secs: f64, default: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.store, StoreConfig::default());
        assert_eq!(settings.worker.isolation, Isolation::Process);
        let options = settings.model_options(None, None);
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert_eq!(options.teardown_timeout, Duration::from_secs(5));
        assert_eq!(options.reply_timeout, None);
        assert!(matches!(options.worker, WorkerMode::Process { program: None, .. }));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "store": {"kind": "remote", "url": "http://models.example"},
                "engine": {"kind": "dry_run"},
                "worker": {"isolation": "thread", "reply_timeout_secs": 30, "poll_interval_secs": -1},
                "log": {"level": "debug"}
            }"#,
        )
        .unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.engine, EngineConfig::DryRun);
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.worker.teardown_timeout_secs, 5.0);

        let options = settings.model_options(Some("B".into()), None);
        assert_eq!(options.optics.as_deref(), Some("B"));
        assert_eq!(options.reply_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(matches!(options.worker, WorkerMode::Thread { .. }));
    }

    #[test]
    fn test_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Settings::load(Some(&dir.path().join("missing.json"))),
            Err(SettingsError::Read { .. })
        ));
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"{"worker": {"isolation": "fork"}}"#).unwrap();
        assert!(matches!(
            Settings::load(Some(&path)),
            Err(SettingsError::Parse { .. })
        ));
    }
}
