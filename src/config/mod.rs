//! Typed configuration from a TOML file and environment variables.
//!
//! Loads once at startup. Environment variables override the file; the
//! command line overrides both.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::SyncOptions;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_workers: usize,
    pub assume_yes: bool,
    pub dry_run: bool,
    pub report_interval_ms: u64,
    /// Extra passes over errored tasks after the first drain.
    pub retries: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_workers: 4,
            assume_yes: false,
            dry_run: false,
            report_interval_ms: 1000,
            retries: 0,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sync: Config,
}

impl Config {
    /// Load configuration from environment variables over the defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Read the `[sync]` table of a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        Ok(file.sync)
    }

    /// TOML file (if any), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = parsed_var("SYNCQ_STORE_WORKERS")? {
            self.store_workers = v;
        }
        if let Some(v) = bool_var("SYNCQ_ASSUME_YES")? {
            self.assume_yes = v;
        }
        if let Some(v) = bool_var("SYNCQ_DRY_RUN")? {
            self.dry_run = v;
        }
        if let Some(v) = parsed_var("SYNCQ_REPORT_INTERVAL_MS")? {
            self.report_interval_ms = v;
        }
        if let Some(v) = parsed_var("SYNCQ_RETRIES")? {
            self.retries = v;
        }
        if let Ok(v) = std::env::var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    /// Options for a [`crate::engine::SyncQueue`].
    pub fn sync_options(&self) -> Result<SyncOptions> {
        if self.store_workers == 0 {
            return Err(Error::Config("store_workers must be at least 1".into()));
        }
        if self.report_interval_ms == 0 {
            return Err(Error::Config("report_interval_ms must be positive".into()));
        }
        Ok(SyncOptions {
            store_workers: self.store_workers,
            assume_yes: self.assume_yes,
            dry_run: self.dry_run,
            report_interval: Duration::from_millis(self.report_interval_ms),
        })
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn bool_var(name: &str) -> Result<Option<bool>> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(Error::Config(format!("{name}={raw:?}: expected a boolean"))),
        },
        Err(_) => Ok(None),
    }
}
