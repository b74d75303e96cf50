use std::env;
use std::time::Duration;

use serde::Deserialize;
use sqli_db::SqliteOpenMode;

use crate::error::{Result, SqliError};

/// How long a result handle may sit undisposed before the sweeper warns.
pub const DEFAULT_EXPIRY_TIMEOUT_MS: u64 = 1024 * 60;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = DEFAULT_EXPIRY_TIMEOUT_MS;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_WORKER_THREAD_NAME: &str = "sqli-worker";

/// Global function invoked for replies that name no callback.
pub const DEFAULT_CLEANUP_HOOK: &str = "sqliClearResult";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub expiry_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub busy_timeout_ms: u64,
    pub open_mode: SqliteOpenMode,
    pub create_if_missing: bool,
    pub debug: bool,
    pub worker_thread_name: String,
    pub cleanup_hook: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiry_timeout_ms: DEFAULT_EXPIRY_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            open_mode: SqliteOpenMode::default(),
            create_if_missing: false,
            debug: false,
            worker_thread_name: DEFAULT_WORKER_THREAD_NAME.to_string(),
            cleanup_hook: DEFAULT_CLEANUP_HOOK.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|err| SqliError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SQLI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SQLI_EXPIRY_TIMEOUT_MS") {
            self.expiry_timeout_ms = parse_u64("SQLI_EXPIRY_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = lookup("SQLI_SWEEP_INTERVAL_MS") {
            self.sweep_interval_ms = parse_u64("SQLI_SWEEP_INTERVAL_MS", &val)?;
        }
        if let Some(val) = lookup("SQLI_BUSY_TIMEOUT_MS") {
            self.busy_timeout_ms = parse_u64("SQLI_BUSY_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = lookup("SQLI_OPEN_MODE") {
            self.open_mode = match val.trim() {
                "read_only" => SqliteOpenMode::ReadOnly,
                "read_write" => SqliteOpenMode::ReadWrite,
                other => {
                    return Err(SqliError::Config(format!(
                        "SQLI_OPEN_MODE must be read_only or read_write, got {other:?}"
                    )));
                }
            };
        }
        if let Some(val) = lookup("SQLI_CREATE_IF_MISSING") {
            self.create_if_missing = parse_flag(&val);
        }
        if let Some(val) = lookup("SQLI_DEBUG") {
            self.debug = parse_flag(&val);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expiry_timeout_ms == 0 {
            return Err(SqliError::Config(
                "expiry_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(SqliError::Config(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.worker_thread_name.is_empty() {
            return Err(SqliError::Config(
                "worker_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn parse_u64(key: &str, val: &str) -> Result<u64> {
    val.trim()
        .parse::<u64>()
        .map_err(|err| SqliError::Config(format!("{key}: {err}")))
}

fn parse_flag(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
