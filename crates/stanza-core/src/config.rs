// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Factory configuration, loadable from environment variables.

use std::time::Duration;

/// Configuration for a factory and the defaults its endpoints inherit.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Default worker count per stage. `0` means "number of hardware
    /// threads". Endpoints and stages may override; their `0` means
    /// "inherit".
    pub default_concurrency: usize,
    /// How long a worker's receive polls before committing an empty
    /// transaction and re-checking its shutdown signal.
    pub poll_interval: Duration,
    /// How long `stop` waits for in-flight scopes before aborting workers.
    /// Aborted scopes roll back.
    pub stop_grace: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 0,
            poll_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl FactoryConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `STANZA_CONCURRENCY`: default workers per stage (0 = hardware threads)
    /// - `STANZA_POLL_INTERVAL_MS`: receive poll window (default: 250)
    /// - `STANZA_STOP_GRACE_MS`: stop grace period (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("STANZA_CONCURRENCY") {
            config.default_concurrency = value.parse().map_err(|_| {
                ConfigError::Invalid("STANZA_CONCURRENCY", "must be a non-negative integer")
            })?;
        }
        if let Ok(value) = std::env::var("STANZA_POLL_INTERVAL_MS") {
            let millis: u64 = value.parse().map_err(|_| {
                ConfigError::Invalid("STANZA_POLL_INTERVAL_MS", "must be a duration in ms")
            })?;
            config.poll_interval = Duration::from_millis(millis);
        }
        if let Ok(value) = std::env::var("STANZA_STOP_GRACE_MS") {
            let millis: u64 = value.parse().map_err(|_| {
                ConfigError::Invalid("STANZA_STOP_GRACE_MS", "must be a duration in ms")
            })?;
            config.stop_grace = Duration::from_millis(millis);
        }
        Ok(config)
    }

    /// The factory default with `0` resolved to the hardware thread count.
    pub(crate) fn resolved_default_concurrency(&self) -> usize {
        if self.default_concurrency > 0 {
            self.default_concurrency
        } else {
            hardware_concurrency()
        }
    }
}

/// Number of hardware threads, with a floor of one.
pub(crate) fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
