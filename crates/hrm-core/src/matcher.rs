//! Heart-rate service and characteristic matching.
//!
//! Pure lookups over GATT identifiers. Both the Bluetooth SIG heart-rate
//! profile and the Garmin vendor variant are recognised.

use uuid::Uuid;

use hrm_types::uuid::{
    ADVERTISED_HEART_RATE_SERVICES, HEART_RATE_CHARACTERISTICS, HEART_RATE_SERVICES,
};
use hrm_types::{GattCharacteristic, GattService};

/// Whether `uuid` identifies a service that carries heart-rate measurements.
#[must_use]
pub fn is_heart_rate_service(uuid: &Uuid) -> bool {
    HEART_RATE_SERVICES.contains(uuid)
}

/// Whether `uuid` identifies a heart-rate measurement characteristic.
#[must_use]
pub fn is_heart_rate_characteristic(uuid: &Uuid) -> bool {
    HEART_RATE_CHARACTERISTICS.contains(uuid)
}

/// First heart-rate measurement characteristic of `service`.
///
/// Returns `None` when the service is not a heart-rate service or has no
/// measurement characteristic.
#[must_use]
pub fn find_heart_rate_characteristic(service: &GattService) -> Option<&GattCharacteristic> {
    if !is_heart_rate_service(&service.uuid) {
        return None;
    }
    service
        .characteristics
        .iter()
        .find(|c| is_heart_rate_characteristic(&c.uuid))
}

/// First heart-rate measurement characteristic across a discovered service table.
#[must_use]
pub fn find_heart_rate_characteristic_in(services: &[GattService]) -> Option<&GattCharacteristic> {
    services.iter().find_map(find_heart_rate_characteristic)
}

/// Whether an advertised service list marks the advertiser as a heart-rate sensor.
#[must_use]
pub fn advertises_heart_rate(services: &[Uuid]) -> bool {
    services
        .iter()
        .any(|s| ADVERTISED_HEART_RATE_SERVICES.contains(s))
}
