//! Filtering of raw advertising records down to heart-rate sensors.

use tracing::trace;

use hrm_types::DiscoveryRecord;

use crate::matcher::advertises_heart_rate;

/// Callback invoked for every record that matches the heart-rate signature.
pub type ProviderCallback = Box<dyn Fn(&DiscoveryRecord) + Send + Sync>;

/// Forwards only advertising records that look like heart-rate sensors.
///
/// Holds no state besides the callback; every record is judged on its own.
#[derive(Default)]
pub struct DeviceProviderFilter {
    callback: Option<ProviderCallback>,
}

impl std::fmt::Debug for DeviceProviderFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProviderFilter")
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl DeviceProviderFilter {
    /// Create a filter with no callback registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter that forwards matches to `callback`.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&DiscoveryRecord) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Judge one record, forwarding it if it matches.
    ///
    /// Returns whether the record matched. Records without a service list
    /// never match.
    pub fn elaborate(&self, record: &DiscoveryRecord) -> bool {
        let Some(services) = record.services.as_deref() else {
            trace!("{}: advertisement without service list", record.identity);
            return false;
        };
        if !advertises_heart_rate(services) {
            return false;
        }
        if let Some(callback) = &self.callback {
            callback(record);
        }
        true
    }
}
