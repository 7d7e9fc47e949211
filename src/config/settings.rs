//! Connection behavior tuning.

use std::time::Duration;

use iotc_mqtt::Jitter;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::ConfigError;

/// Optional settings controlling the MQTT connect loop and log chatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientSettings {
    /// Log connection progress and per-message traffic at info level.
    pub verbose: bool,

    /// Seconds to wait for a session to come up after the broker accepted
    /// the transport connection.
    #[validate(range(min = 1, message = "connect_timeout_secs must be at least 1"))]
    pub connect_timeout_secs: u64,

    /// Connect attempts made by one `connect()` call.
    #[validate(range(min = 1, message = "connect_tries must be at least 1"))]
    pub connect_tries: u32,

    /// Upper bound of the random pause between connect attempts.
    #[validate(range(min = 1, message = "connect_backoff_max_secs must be at least 1"))]
    pub connect_backoff_max_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            verbose: true,
            connect_timeout_secs: 30,
            connect_tries: 100,
            connect_backoff_max_secs: 15,
        }
    }
}

impl ClientSettings {
    /// Validates the settings, consuming and returning them.
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` naming the offending field.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pause drawn between connect attempts.
    pub fn connect_jitter(&self) -> Jitter {
        Jitter::from_max_secs(self.connect_backoff_max_secs)
    }
}
