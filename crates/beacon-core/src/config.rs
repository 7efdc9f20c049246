//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for [`BeaconEngine`](crate::engine::BeaconEngine) and the
/// `btleplug` backend.
///
/// # Example
///
/// ```
/// use beacon_core::EngineConfig;
///
/// let config = EngineConfig::from_toml_str("connect_timeout_secs = 10").unwrap();
/// assert_eq!(config.connect_timeout(), Some(std::time::Duration::from_secs(10)));
/// assert_eq!(config.event_capacity, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the engine and scanner broadcast channels.
    pub event_capacity: usize,
    /// Upper bound on the `Connecting` state. `None` waits for the link.
    pub connect_timeout_secs: Option<u64>,
    /// Length of one ranging window in milliseconds.
    pub ranging_period_ms: u64,
    /// Silence after which a monitored region counts as exited.
    pub monitor_exit_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 100,
            connect_timeout_secs: None,
            ranging_period_ms: 1000,
            monitor_exit_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::invalid_config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Set the broadcast channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Bound the `Connecting` state.
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    /// Set the ranging window.
    pub fn ranging_period_ms(mut self, ms: u64) -> Self {
        self.ranging_period_ms = ms;
        self
    }

    /// Set the monitoring exit timeout.
    pub fn monitor_exit_timeout_secs(mut self, secs: u64) -> Self {
        self.monitor_exit_timeout_secs = secs;
        self
    }

    /// The connect bound as a duration.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    /// The ranging window as a duration.
    pub fn ranging_period(&self) -> Duration {
        Duration::from_millis(self.ranging_period_ms)
    }

    /// The monitoring exit timeout as a duration.
    pub fn monitor_exit_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_exit_timeout_secs)
    }

    /// Validate the configuration.
    ///
    /// Checks that:
    /// - `event_capacity` is > 0
    /// - `connect_timeout_secs`, when set, is > 0
    /// - `ranging_period_ms` is >= 100
    /// - `monitor_exit_timeout_secs` is > 0
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        if self.connect_timeout_secs == Some(0) {
            return Err(Error::invalid_config("connect_timeout_secs must be > 0"));
        }
        if self.ranging_period_ms < 100 {
            return Err(Error::invalid_config("ranging_period_ms must be >= 100"));
        }
        if self.monitor_exit_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "monitor_exit_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }
}
