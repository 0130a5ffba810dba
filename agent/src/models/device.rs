//! Device configurations and registrations

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A type of data a device can collect, e.g. "geolocation" or "heartrate"
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataType(pub String);

impl DataType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of physical device a role in a protocol stands for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    /// A smartphone running the study client
    Smartphone,

    /// A Bluetooth Low Energy heart rate sensor, identified by MAC address
    BleHeartRate,

    /// An AltBeacon proximity beacon
    AltBeacon,

    /// Any other device, registered with a plain device ID
    Custom { type_name: String },
}

impl DeviceKind {
    /// Name used when reporting capability problems
    pub fn type_name(&self) -> &str {
        match self {
            DeviceKind::Smartphone => "smartphone",
            DeviceKind::BleHeartRate => "ble_heart_rate",
            DeviceKind::AltBeacon => "alt_beacon",
            DeviceKind::Custom { type_name } => type_name,
        }
    }

    /// Check whether `registration` is structurally valid for this kind of device
    pub fn validate_registration(&self, registration: &DeviceRegistration) -> Result<(), String> {
        if registration.device_id.trim().is_empty() {
            return Err("device ID is empty".to_string());
        }

        match (self, &registration.details) {
            (DeviceKind::Smartphone, RegistrationDetails::Default)
            | (DeviceKind::Smartphone, RegistrationDetails::Smartphone { .. }) => Ok(()),
            (DeviceKind::BleHeartRate, RegistrationDetails::MacAddress { mac_address }) => {
                if !is_valid_mac_address(mac_address) {
                    return Err(format!("'{}' is not a valid MAC address", mac_address));
                }
                if !registration.device_id.eq_ignore_ascii_case(mac_address) {
                    return Err("device ID must equal the MAC address".to_string());
                }
                Ok(())
            }
            (DeviceKind::AltBeacon, RegistrationDetails::AltBeacon { .. }) => Ok(()),
            (DeviceKind::Custom { .. }, RegistrationDetails::Default) => Ok(()),
            (kind, details) => Err(format!(
                "a {} registration is not valid for a {} device",
                details.name(),
                kind.type_name()
            )),
        }
    }
}

/// Accepts six hex octets separated by ':' or '-'
fn is_valid_mac_address(value: &str) -> bool {
    let separator = if value.contains(':') { ':' } else { '-' };
    let octets: Vec<&str> = value.split(separator).collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// A device as it is declared in a study protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    /// Unique name of the device within the protocol
    pub role_name: String,

    /// Kind of device
    #[serde(flatten)]
    pub kind: DeviceKind,

    /// Optional devices do not block the deployment from running
    #[serde(default)]
    pub is_optional: bool,
}

impl DeviceConfiguration {
    pub fn new(role_name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            role_name: role_name.into(),
            kind,
            is_optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }
}

/// Kind-specific registration details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrationDetails {
    Default,
    Smartphone {
        platform: String,
        os_version: Option<String>,
    },
    MacAddress {
        mac_address: String,
    },
    AltBeacon {
        manufacturer_id: u16,
        organization_id: String,
        major_id: u16,
        minor_id: u16,
    },
}

impl RegistrationDetails {
    fn name(&self) -> &'static str {
        match self {
            RegistrationDetails::Default => "default",
            RegistrationDetails::Smartphone { .. } => "smartphone",
            RegistrationDetails::MacAddress { .. } => "MAC address",
            RegistrationDetails::AltBeacon { .. } => "AltBeacon",
        }
    }
}

/// Configuration a device supplies to participate in a study deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Identifier unique across a study deployment
    pub device_id: String,

    /// Human readable name shown to participants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,

    /// When the registration was created
    pub registration_created_on: DateTime<Utc>,

    #[serde(flatten)]
    pub details: RegistrationDetails,
}

impl DeviceRegistration {
    /// Registration with no kind-specific details
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_display_name: None,
            registration_created_on: Utc::now(),
            details: RegistrationDetails::Default,
        }
    }

    /// Registration for a device identified by its MAC address
    pub fn mac_address(mac_address: impl Into<String>) -> Self {
        let mac_address = mac_address.into();
        Self {
            device_id: mac_address.clone(),
            device_display_name: None,
            registration_created_on: Utc::now(),
            details: RegistrationDetails::MacAddress { mac_address },
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.device_display_name = Some(name.into());
        self
    }
}
