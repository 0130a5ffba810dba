//! Configuration slices handed to primary devices

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::device::{DataType, DeviceConfiguration, DeviceRegistration};
use crate::models::protocol::{TaskConfiguration, TaskControl, TriggerConfiguration};

/// Version of the registrations a configuration slice was built from
///
/// Returned with every slice and required when confirming the deployment, so
/// that a device never confirms a slice which went stale in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationToken(pub u64);

impl fmt::Display for ConfigurationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Everything a primary device needs to run its part of a study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryDeviceDeployment {
    pub device_configuration: DeviceConfiguration,
    pub registration: DeviceRegistration,

    /// Devices connected to this device, directly or through other connected devices
    pub connected_devices: Vec<DeviceConfiguration>,

    /// Registrations of the connected devices registered so far
    pub connected_device_registrations: BTreeMap<String, DeviceRegistration>,

    pub tasks: Vec<TaskConfiguration>,
    pub triggers: BTreeMap<u32, TriggerConfiguration>,
    pub task_controls: Vec<TaskControl>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_data: Option<String>,

    pub last_update: ConfigurationToken,
}

impl PrimaryDeviceDeployment {
    pub fn role_name(&self) -> &str {
        &self.device_configuration.role_name
    }

    pub fn connected_device(&self, role_name: &str) -> Option<&DeviceConfiguration> {
        self.connected_devices.iter().find(|d| d.role_name == role_name)
    }

    /// Data types to collect, per device role running the measuring task
    pub fn required_data_types(&self) -> BTreeMap<String, BTreeSet<DataType>> {
        let mut required: BTreeMap<String, BTreeSet<DataType>> = BTreeMap::new();
        for control in &self.task_controls {
            let Some(task) = self.tasks.iter().find(|t| t.name == control.task_name) else {
                continue;
            };
            required
                .entry(control.destination_device_role_name.clone())
                .or_default()
                .extend(task.measures.iter().map(|m| m.data_type.clone()));
        }
        required
    }
}
