//! Runtime configuration.
//!
//! Read from a TOML file named by `CXXRT_CONFIG`, with individual
//! environment overrides on top:
//!
//! ```toml
//! backtrace_on_uncaught = true
//! thread_local_handlers = false
//! ```

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_PATH_VAR: &str = "CXXRT_CONFIG";
pub const BACKTRACE_VAR: &str = "CXXRT_BACKTRACE";
pub const THREAD_LOCAL_HANDLERS_VAR: &str = "CXXRT_THREAD_LOCAL_HANDLERS";

/// Process-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Print a symbolic back-trace when an exception escapes.
    pub backtrace_on_uncaught: bool,

    /// Store terminate/unexpected hooks per thread instead of process-wide.
    pub thread_local_handlers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backtrace_on_uncaught: true,
            thread_local_handlers: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(value) = lookup(BACKTRACE_VAR) {
            config.backtrace_on_uncaught = parse_flag(BACKTRACE_VAR, &value)?;
        }
        if let Some(value) = lookup(THREAD_LOCAL_HANDLERS_VAR) {
            config.thread_local_handlers = parse_flag(THREAD_LOCAL_HANDLERS_VAR, &value)?;
        }
        Ok(config)
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            name,
            value: value.to_string(),
        }),
    }
}

static CURRENT: OnceLock<RuntimeConfig> = OnceLock::new();

/// Installs the process-wide configuration. Only the first call succeeds.
pub fn install(config: RuntimeConfig) -> Result<&'static RuntimeConfig, ConfigError> {
    let mut config = Some(config);
    let installed = CURRENT.get_or_init(|| config.take().unwrap_or_default());
    if config.is_some() {
        return Err(ConfigError::AlreadyInstalled);
    }
    Ok(installed)
}

/// The process-wide configuration.
///
/// Before [`install`] this loads the environment, falling back to defaults
/// if that fails.
pub fn current() -> &'static RuntimeConfig {
    CURRENT.get_or_init(|| {
        RuntimeConfig::from_env().unwrap_or_else(|err| {
            log::warn!("ignoring runtime configuration: {err}");
            RuntimeConfig::default()
        })
    })
}
