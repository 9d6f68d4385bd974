//! Configuration module for sqlbridge.
//!
//! Handles TOML config files with environment variable expansion and
//! worker binary discovery.

mod settings;

pub use settings::{
    expand_env_vars, DatabaseSettings, DbOpts, Settings, SettingsError, WorkerSettings,
};
