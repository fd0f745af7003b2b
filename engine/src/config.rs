//! Engine launch configuration.
//!
//! An [`EngineConfig`] is an immutable snapshot handed to [`crate::Engine`] at
//! start. It is usually loaded from a JSON file; durations are stored as
//! millisecond fields so the file stays flat.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineFamily;

/// Default wait for a graceful exit after the quit command.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Default wait after closing the pipes before killing the process.
pub const DEFAULT_PIPE_CLOSE_GRACE_MS: u64 = 500;

/// Default bound on a single stdin write.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{what} file not found: {path}")]
    MissingFile { what: &'static str, path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Names the instance in logs.
    #[serde(default = "default_label")]
    pub label: String,
    pub family: EngineFamily,
    pub program: PathBuf,
    /// Extra arguments appended after the family's own.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Engine config file (`-config` for KataGo).
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    /// Network weights.
    #[serde(default)]
    pub model_file: Option<PathBuf>,
    /// Search parameters passed on the command line.
    #[serde(default)]
    pub search_params: BTreeMap<String, String>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_pipe_close_grace_ms")]
    pub pipe_close_grace_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Timeout for requests that do not set their own.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Progress interval for requests that do not set their own.
    #[serde(default)]
    pub report_interval_ms: Option<u64>,
}

fn default_label() -> String {
    "engine".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_pipe_close_grace_ms() -> u64 {
    DEFAULT_PIPE_CLOSE_GRACE_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

impl EngineConfig {
    pub fn new(family: EngineFamily, program: impl Into<PathBuf>) -> Self {
        Self {
            label: family.to_string(),
            family,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            config_file: None,
            model_file: None,
            search_params: BTreeMap::new(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            pipe_close_grace_ms: DEFAULT_PIPE_CLOSE_GRACE_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            request_timeout_ms: None,
            report_interval_ms: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full argument list for the engine process.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self.family {
            EngineFamily::KatagoAnalysis | EngineFamily::KatagoGtp => {
                args.push(
                    if self.family == EngineFamily::KatagoAnalysis {
                        "analysis"
                    } else {
                        "gtp"
                    }
                    .to_string(),
                );
                if let Some(config) = &self.config_file {
                    args.push("-config".to_string());
                    args.push(config.display().to_string());
                }
                if let Some(model) = &self.model_file {
                    args.push("-model".to_string());
                    args.push(model.display().to_string());
                }
                if !self.search_params.is_empty() {
                    let overrides: Vec<String> = self
                        .search_params
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    args.push("-override-config".to_string());
                    args.push(overrides.join(","));
                }
            }
            EngineFamily::LeelaZeroGtp => {
                args.push("--gtp".to_string());
                args.push("--noponder".to_string());
                if let Some(model) = &self.model_file {
                    args.push("--weights".to_string());
                    args.push(model.display().to_string());
                }
                for (key, value) in &self.search_params {
                    args.push(format!("--{}", key));
                    args.push(value.clone());
                }
            }
        }
        args.extend(self.args.iter().cloned());
        args
    }

    /// Make sure the config and model files exist before launching.
    pub fn check_files(&self) -> Result<(), ConfigError> {
        let files = [
            ("Config", self.config_file.as_ref()),
            ("Model", self.model_file.as_ref()),
        ];
        for (what, path) in files {
            let Some(path) = path else { continue };
            let resolved = self.resolve(path);
            if !resolved.exists() {
                return Err(ConfigError::MissingFile {
                    what,
                    path: resolved,
                });
            }
        }
        Ok(())
    }

    /// Relative paths are taken from the working directory when one is set.
    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn pipe_close_grace(&self) -> Duration {
        Duration::from_millis(self.pipe_close_grace_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        self.report_interval_ms.map(Duration::from_millis)
    }
}
