//! TOML-based configuration for sqlbridge.
//!
//! Supports a config file (sqlbridge.toml) with environment variable
//! expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! path = "./sqlite-worker"
//! args = ["--readonly"]
//! request_timeout_secs = 30
//!
//! [database]
//! data_url = "${DATA_DIR}/app.db"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::DEFAULT_TIMEOUT_SECS;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Worker binary not found; set worker.path in the config file")]
    WorkerNotFound,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseSettings,
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker binary (supports ${ENV_VAR} expansion).
    pub path: Option<String>,

    /// Extra arguments passed to the worker binary.
    pub args: Vec<String>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Location of the data file shipped to the worker on init
    /// (supports ${ENV_VAR} expansion).
    pub data_url: Option<String>,
}

/// Everything needed to spawn and initialize one worker.
#[derive(Debug, Clone)]
pub struct DbOpts {
    /// Location of the data file, handed to the data source on init.
    pub data_url: String,

    /// Path to the worker binary.
    pub worker_path: PathBuf,

    /// Extra arguments for the worker binary.
    pub worker_args: Vec<String>,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl DbOpts {
    /// Options with the default timeout and no extra worker arguments.
    pub fn new(data_url: impl Into<String>, worker_path: impl Into<PathBuf>) -> Self {
        Self {
            data_url: data_url.into(),
            worker_path: worker_path.into(),
            worker_args: Vec::new(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Set extra worker arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `SQLBRIDGE_CONFIG`
    /// 2. `./sqlbridge.toml`
    /// 3. `~/.config/sqlbridge/config.toml`
    ///
    /// Falls back to defaults when no file exists.
    pub fn load() -> Result<Self, SettingsError> {
        // Check environment variable first
        if let Ok(path) = env::var("SQLBRIDGE_CONFIG") {
            return Self::from_file(&path);
        }

        // Check local directory
        let local_config = PathBuf::from("sqlbridge.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        // Check user config directory
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("sqlbridge").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Return defaults if no config file found
        Ok(Settings::default())
    }

    /// Get the worker binary path.
    ///
    /// Returns the configured path with environment variables expanded,
    /// or searches common locations and PATH.
    pub fn worker_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.worker.path {
            let expanded = expand_env_vars(path).ok()?;
            return Some(PathBuf::from(expanded));
        }

        // Search common locations
        let candidates = [
            "sqlbridge-worker",
            "./sqlbridge-worker",
            "./worker/sqlbridge-worker",
        ];

        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Some(path);
            }
        }

        // Try PATH
        if let Ok(output) = std::process::Command::new("which")
            .arg("sqlbridge-worker")
            .output()
        {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }

        None
    }

    /// Get the data file location with environment variables expanded.
    pub fn data_url(&self) -> Result<String, SettingsError> {
        let raw = self.database.data_url.as_deref().ok_or_else(|| {
            SettingsError::InvalidConfig("database.data_url is required".to_string())
        })?;
        expand_env_vars(raw)
    }

    /// Build worker options from these settings.
    ///
    /// # Errors
    ///
    /// Fails if no data url is configured or no worker binary can be
    /// found.
    pub fn db_opts(&self) -> Result<DbOpts, SettingsError> {
        let data_url = self.data_url()?;
        let worker_path = self.worker_path().ok_or(SettingsError::WorkerNotFound)?;

        Ok(DbOpts {
            data_url,
            worker_path,
            worker_args: self.worker.args.clone(),
            request_timeout: Duration::from_secs(self.worker.request_timeout_secs),
        })
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            // Check for ${VAR} or $VAR
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '}' {
                        chars.next(); // consume '}'
                        break;
                    }
                    var_name.push(chars.next().unwrap());
                }
                let value = env::var(&var_name)
                    .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                result.push_str(&value);
            } else {
                // $VAR (ends at non-alphanumeric/underscore)
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        var_name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                if var_name.is_empty() {
                    // Just a lone $, keep it
                    result.push('$');
                } else {
                    let value = env::var(&var_name)
                        .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                    result.push_str(&value);
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}
