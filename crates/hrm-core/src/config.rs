//! Tunables for connections and the manager.

use std::time::Duration;

use crate::error::{Error, Result};

/// Timing and retry settings for a single device connection.
///
/// The defaults are tuned for phone-class BLE stacks, which tend to report a
/// link as up before service discovery is reliable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Pause between the link coming up and service discovery.
    pub settle_delay: Duration,
    /// Pause after the explicit disconnect of a recovery cycle.
    pub recovery_disconnect_pause: Duration,
    /// Pause after closing the old session, before reopening.
    pub recovery_reopen_pause: Duration,
    /// How long a requested disconnect waits for the transport to confirm.
    pub disconnect_timeout: Duration,
    /// How long to wait for the link to come up after opening a session.
    pub connect_timeout: Duration,
    /// Upper bound for service discovery and the notification subscription.
    pub operation_timeout: Duration,
    /// Consecutive link faults that are recovered before giving up.
    pub max_recovery_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1600),
            recovery_disconnect_pause: Duration::from_millis(1000),
            recovery_reopen_pause: Duration::from_millis(800),
            disconnect_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(10),
            max_recovery_attempts: 1,
        }
    }
}

impl ConnectionConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the settle delay.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set both recovery pauses.
    pub fn recovery_pauses(mut self, after_disconnect: Duration, before_reopen: Duration) -> Self {
        self.recovery_disconnect_pause = after_disconnect;
        self.recovery_reopen_pause = before_reopen;
        self
    }

    /// Set the disconnect timeout.
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the operation timeout.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set how many consecutive faults are recovered.
    pub fn max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Validate the config and return an error if invalid.
    ///
    /// Checks that:
    /// - `disconnect_timeout` is > 0
    /// - `connect_timeout` is > 0
    /// - `operation_timeout` is > 0
    pub fn validate(&self) -> Result<()> {
        if self.disconnect_timeout.is_zero() {
            return Err(Error::invalid_config("disconnect_timeout must be > 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        if self.operation_timeout.is_zero() {
            return Err(Error::invalid_config("operation_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Settings for [`HeartRateManager`](crate::HeartRateManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Settings applied to every connection the manager creates.
    pub connection: ConnectionConfig,
    /// Capacity of the listener event queue.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            event_capacity: 100,
        }
    }
}

impl ManagerConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-connection settings.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the listener event queue capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the config and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        self.connection.validate()
    }
}
