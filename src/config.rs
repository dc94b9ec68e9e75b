//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
///
/// All values carry defaults, so `Config::default()` is a fully working
/// production profile; the environment (prefixed with `LATTICE_`) can
/// override any field.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The interval in milliseconds at which peers re-publish their liveness
    /// records and consumers re-run their subscribe flow.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// The TTL in milliseconds of distributed lock entries.
    ///
    /// A lock holder which crashes without releasing is reclaimed after this
    /// interval; critical sections longer than this risk concurrent entry.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Max number of messages retained per subscription stream.
    #[serde(default = "default_stream_max_messages")]
    pub stream_max_messages: i64,
    /// Max age in seconds of messages retained per subscription stream.
    #[serde(default = "default_stream_max_age_secs")]
    pub stream_max_age_secs: u64,
    /// Max total bytes retained per subscription stream.
    #[serde(default = "default_stream_max_bytes")]
    pub stream_max_bytes: i64,
    /// Max size in bytes of a single message on a subscription stream.
    #[serde(default = "default_stream_max_message_size")]
    pub stream_max_message_size: i32,
}

impl Config {
    /// Create a new config instance from the environment.
    ///
    /// Recognized variables are the field names uppercased with a `LATTICE_`
    /// prefix, e.g. `LATTICE_HEARTBEAT_INTERVAL_MS`.
    pub fn new() -> Result<Self> {
        envy::prefixed("LATTICE_").from_env().context("error building config from env")
    }

    /// The heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The lock TTL as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Build an instance for use in tests, with a development heartbeat.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            heartbeat_interval_ms: 3_000,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stream_max_messages: default_stream_max_messages(),
            stream_max_age_secs: default_stream_max_age_secs(),
            stream_max_bytes: default_stream_max_bytes(),
            stream_max_message_size: default_stream_max_message_size(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_stream_max_messages() -> i64 {
    100_000
}

fn default_stream_max_age_secs() -> u64 {
    60 * 60 * 2
}

fn default_stream_max_bytes() -> i64 {
    100 * 1024 * 1024
}

fn default_stream_max_message_size() -> i32 {
    100 * 1024
}
