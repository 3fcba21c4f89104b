// core/src/config.rs

//! Process-level configuration.
//!
//! Values come from `CONDUIT_*` environment variables. The snapshot returned by
//! [`RuntimeConfig::process`] is read once and never changes afterwards.

use once_cell::sync::Lazy;

use crate::error::ConduitError;
use crate::pipe::PipeOptions;

pub const ENV_ASYNC_WAITER_METRICS: &str = "CONDUIT_ASYNC_WAITER_METRICS";
pub const ENV_RECEIVE_BUFFER_SIZE: &str = "CONDUIT_RECEIVE_BUFFER_SIZE";
pub const ENV_PAUSE_WRITER_THRESHOLD: &str = "CONDUIT_PAUSE_WRITER_THRESHOLD";
pub const ENV_RESUME_WRITER_THRESHOLD: &str = "CONDUIT_RESUME_WRITER_THRESHOLD";

static PROCESS_CONFIG: Lazy<RuntimeConfig> = Lazy::new(|| match RuntimeConfig::from_env() {
  Ok(config) => {
    tracing::debug!(?config, "Runtime configuration loaded");
    config
  }
  Err(e) => {
    tracing::warn!(error = %e, "Invalid runtime configuration in environment, using defaults");
    RuntimeConfig::default()
  }
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
  /// Publish parked-waiter counts of runtime-created semaphores to a shared gauge.
  pub async_waiter_metrics: bool,
  /// Options for pipes created through a [`Runtime`](crate::Runtime).
  pub pipe: PipeOptions,
}

impl RuntimeConfig {
  /// The immutable per-process snapshot, read from the environment on first use.
  /// An invalid environment falls back to defaults.
  pub fn process() -> &'static RuntimeConfig {
    &PROCESS_CONFIG
  }

  /// Reads the environment. Unset variables keep their defaults.
  pub fn from_env() -> Result<Self, ConduitError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConduitError> {
    let mut config = Self::default();

    if let Some(raw) = lookup(ENV_ASYNC_WAITER_METRICS) {
      config.async_waiter_metrics = parse_bool_env(ENV_ASYNC_WAITER_METRICS, &raw)?;
    }
    if let Some(raw) = lookup(ENV_RECEIVE_BUFFER_SIZE) {
      config.pipe.receive_buffer_size = parse_usize_env(ENV_RECEIVE_BUFFER_SIZE, &raw)?;
    }
    if let Some(raw) = lookup(ENV_PAUSE_WRITER_THRESHOLD) {
      config.pipe.pause_writer_threshold = parse_usize_env(ENV_PAUSE_WRITER_THRESHOLD, &raw)?;
    }
    if let Some(raw) = lookup(ENV_RESUME_WRITER_THRESHOLD) {
      config.pipe.resume_writer_threshold = parse_usize_env(ENV_RESUME_WRITER_THRESHOLD, &raw)?;
    }

    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConduitError> {
    self.pipe.validate()
  }
}

/// Recognises exactly `True`, `true`, `1`, `False`, `false` and `0`.
pub fn parse_bool_token(value: &str) -> Option<bool> {
  match value {
    "True" | "true" | "1" => Some(true),
    "False" | "false" | "0" => Some(false),
    _ => None,
  }
}

fn parse_bool_env(key: &str, raw: &str) -> Result<bool, ConduitError> {
  parse_bool_token(raw.trim())
    .ok_or_else(|| ConduitError::InvalidConfig(format!("{} expects a boolean, got {:?}", key, raw)))
}

fn parse_usize_env(key: &str, raw: &str) -> Result<usize, ConduitError> {
  raw
    .trim()
    .parse::<usize>()
    .map_err(|e| ConduitError::InvalidConfig(format!("{} expects a non-negative integer, got {:?}: {}", key, raw, e)))
}
