//! What this device is able to collect

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::device::{DataType, DeviceKind, DeviceRegistration};

/// Answers whether this device can run what a deployment asks of it
pub trait DeviceDataCollector: Send + Sync {
    /// Whether this device can connect to and collect from a connected device
    fn supports_connected_device(&self, kind: &DeviceKind, registration: &DeviceRegistration) -> bool;

    /// Whether `data_type` can be sampled on this device itself
    fn supports_data_type(&self, data_type: &DataType) -> bool;

    /// Whether `data_type` can be collected through a connected device of `kind`
    fn supports_connected_data_type(&self, kind: &DeviceKind, data_type: &DataType) -> bool;
}

/// Capabilities declared up front, e.g. in the settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDataCollector {
    /// Data types sampled by this device
    #[serde(default)]
    pub local_data_types: BTreeSet<DataType>,

    /// Data types collected per supported connected device type name
    #[serde(default)]
    pub connected_devices: BTreeMap<String, BTreeSet<DataType>>,
}

impl StaticDataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local<I, S>(mut self, data_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_data_types
            .extend(data_types.into_iter().map(DataType::new));
        self
    }

    pub fn with_connected<I, S>(mut self, kind: &DeviceKind, data_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connected_devices
            .entry(kind.type_name().to_string())
            .or_default()
            .extend(data_types.into_iter().map(DataType::new));
        self
    }
}

impl DeviceDataCollector for StaticDataCollector {
    fn supports_connected_device(&self, kind: &DeviceKind, registration: &DeviceRegistration) -> bool {
        self.connected_devices.contains_key(kind.type_name())
            && kind.validate_registration(registration).is_ok()
    }

    fn supports_data_type(&self, data_type: &DataType) -> bool {
        self.local_data_types.contains(data_type)
    }

    fn supports_connected_data_type(&self, kind: &DeviceKind, data_type: &DataType) -> bool {
        self.connected_devices
            .get(kind.type_name())
            .is_some_and(|types| types.contains(data_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_collector() {
        let collector = StaticDataCollector::new()
            .with_local(["geolocation"])
            .with_connected(&DeviceKind::BleHeartRate, ["heartrate"]);

        assert!(collector.supports_data_type(&DataType::new("geolocation")));
        assert!(!collector.supports_data_type(&DataType::new("heartrate")));
        assert!(collector.supports_connected_data_type(&DeviceKind::BleHeartRate, &DataType::new("heartrate")));
        assert!(collector.supports_connected_device(
            &DeviceKind::BleHeartRate,
            &DeviceRegistration::mac_address("00:11:22:33:44:55")
        ));
        assert!(!collector.supports_connected_device(
            &DeviceKind::AltBeacon,
            &DeviceRegistration::new("beacon")
        ));
    }
}
