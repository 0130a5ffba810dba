//! Study protocol snapshots
//!
//! A protocol snapshot is authored elsewhere and handed to a deployment as
//! immutable input. It declares the devices taking part, how connected devices
//! attach to primary devices, which tasks run on which device, and which data
//! participants need to provide.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DeploymentError;
use crate::models::device::{DataType, DeviceConfiguration};
use crate::participants::data::{expected_data_conflicts, ExpectedParticipantData};

/// Attaches a connected device to the device that relays for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConnection {
    /// Role of the connected device
    pub role_name: String,

    /// Role of the device it connects to, primary or connected
    pub connected_to_role_name: String,
}

/// Something measured while a task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measure {
    pub data_type: DataType,
}

/// A task a device runs once triggered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub measures: Vec<Measure>,
}

/// Condition starting or stopping tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires once the given time elapsed since the study started
    ElapsedTime { elapsed_secs: u64 },

    /// Fires when the participant selects it
    Manual { label: String },
}

/// A trigger evaluated on a source device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfiguration {
    pub source_device_role_name: String,

    #[serde(flatten)]
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Start,
    Stop,
}

/// Starts or stops `task_name` on a destination device when a trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskControl {
    pub trigger_id: u32,
    pub task_name: String,
    pub destination_device_role_name: String,
    pub control: Control,
}

/// A role participants can take in a study
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRole {
    pub role: String,

    #[serde(default)]
    pub is_optional: bool,
}

/// Who something is assigned to: everyone, or a set of participant roles
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "assigned_to", content = "roles", rename_all = "snake_case")]
pub enum AssignedTo {
    All,
    Roles(BTreeSet<String>),
}

impl AssignedTo {
    pub fn roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AssignedTo::Roles(roles.into_iter().map(Into::into).collect())
    }

    /// Whether this assignment covers `role`
    pub fn includes(&self, role: &str) -> bool {
        match self {
            AssignedTo::All => true,
            AssignedTo::Roles(roles) => roles.contains(role),
        }
    }
}

/// Immutable description of a study, as deployed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyProtocolSnapshot {
    pub id: Uuid,
    pub name: String,
    pub created_on: DateTime<Utc>,

    pub primary_devices: Vec<DeviceConfiguration>,

    #[serde(default)]
    pub connected_devices: Vec<DeviceConfiguration>,

    #[serde(default)]
    pub connections: Vec<DeviceConnection>,

    #[serde(default)]
    pub tasks: Vec<TaskConfiguration>,

    #[serde(default)]
    pub triggers: BTreeMap<u32, TriggerConfiguration>,

    #[serde(default)]
    pub task_controls: Vec<TaskControl>,

    #[serde(default)]
    pub participant_roles: Vec<ParticipantRole>,

    /// Primary device roles per participant role; unassigned primary devices
    /// are used by every participant
    #[serde(default)]
    pub assigned_devices: BTreeMap<String, BTreeSet<String>>,

    #[serde(default)]
    pub expected_participant_data: Vec<ExpectedParticipantData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_data: Option<String>,
}

impl StudyProtocolSnapshot {
    /// Empty protocol with a single primary device
    pub fn new(name: impl Into<String>, primary_device: DeviceConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_on: Utc::now(),
            primary_devices: vec![primary_device],
            connected_devices: Vec::new(),
            connections: Vec::new(),
            tasks: Vec::new(),
            triggers: BTreeMap::new(),
            task_controls: Vec::new(),
            participant_roles: Vec::new(),
            assigned_devices: BTreeMap::new(),
            expected_participant_data: Vec::new(),
            application_data: None,
        }
    }

    /// All devices, primary devices first
    pub fn devices(&self) -> impl Iterator<Item = &DeviceConfiguration> {
        self.primary_devices.iter().chain(self.connected_devices.iter())
    }

    pub fn device(&self, role_name: &str) -> Option<&DeviceConfiguration> {
        self.devices().find(|d| d.role_name == role_name)
    }

    pub fn is_primary_device(&self, role_name: &str) -> bool {
        self.primary_devices.iter().any(|d| d.role_name == role_name)
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfiguration> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Primary device roles used by participants holding any of `roles`
    pub fn primary_devices_assigned_to(&self, roles: &AssignedTo) -> BTreeSet<String> {
        self.primary_devices
            .iter()
            .filter(|device| {
                let assigned_roles: Vec<&String> = self
                    .assigned_devices
                    .iter()
                    .filter(|(_, devices)| devices.contains(&device.role_name))
                    .map(|(role, _)| role)
                    .collect();

                assigned_roles.is_empty()
                    || match roles {
                        AssignedTo::All => true,
                        AssignedTo::Roles(held) => assigned_roles.iter().any(|r| held.contains(*r)),
                    }
            })
            .map(|d| d.role_name.clone())
            .collect()
    }

    /// Check the structural integrity of the snapshot before deploying it
    pub fn validate(&self) -> Result<(), DeploymentError> {
        let invalid = |message: String| Err(DeploymentError::InvalidArgument(message));

        if self.primary_devices.is_empty() {
            return invalid("a protocol needs at least one primary device".to_string());
        }

        let mut roles = HashSet::new();
        for device in self.devices() {
            if !roles.insert(device.role_name.as_str()) {
                return invalid(format!("device role '{}' is declared twice", device.role_name));
            }
        }

        // Every connected device hangs off exactly one device and reaches a primary device
        for device in &self.connected_devices {
            let parents: Vec<&DeviceConnection> = self
                .connections
                .iter()
                .filter(|c| c.role_name == device.role_name)
                .collect();
            if parents.len() != 1 {
                return invalid(format!(
                    "connected device '{}' must be connected to exactly one device",
                    device.role_name
                ));
            }
            if self.primary_of(&device.role_name).is_none() {
                return invalid(format!(
                    "connected device '{}' is not connected to a primary device",
                    device.role_name
                ));
            }
        }
        for connection in &self.connections {
            if self.is_primary_device(&connection.role_name) {
                return invalid(format!(
                    "primary device '{}' cannot be connected to another device",
                    connection.role_name
                ));
            }
            if !roles.contains(connection.role_name.as_str())
                || !roles.contains(connection.connected_to_role_name.as_str())
            {
                return invalid(format!(
                    "connection '{}' -> '{}' references an unknown device",
                    connection.role_name, connection.connected_to_role_name
                ));
            }
        }

        for (id, trigger) in &self.triggers {
            if !roles.contains(trigger.source_device_role_name.as_str()) {
                return invalid(format!(
                    "trigger {} has unknown source device '{}'",
                    id, trigger.source_device_role_name
                ));
            }
        }
        for control in &self.task_controls {
            if !self.triggers.contains_key(&control.trigger_id) {
                return invalid(format!("task control references unknown trigger {}", control.trigger_id));
            }
            if self.task(&control.task_name).is_none() {
                return invalid(format!("task control references unknown task '{}'", control.task_name));
            }
            if !roles.contains(control.destination_device_role_name.as_str()) {
                return invalid(format!(
                    "task control references unknown device '{}'",
                    control.destination_device_role_name
                ));
            }
        }

        let participant_roles: HashSet<&str> =
            self.participant_roles.iter().map(|r| r.role.as_str()).collect();
        for (role, devices) in &self.assigned_devices {
            if !participant_roles.contains(role.as_str()) {
                return invalid(format!("devices are assigned to unknown participant role '{}'", role));
            }
            if let Some(device) = devices.iter().find(|d| !self.is_primary_device(d)) {
                return invalid(format!("only primary devices can be assigned, '{}' is not one", device));
            }
        }

        expected_data_conflicts(&self.expected_participant_data)
    }

    /// The primary device relaying for `role_name`, which is the device itself
    /// when it is a primary device
    pub fn primary_of(&self, role_name: &str) -> Option<&str> {
        let mut current = role_name;
        // Bounded by the device count so cyclic connections terminate
        for _ in 0..=self.connected_devices.len() {
            if let Some(primary) = self.primary_devices.iter().find(|d| d.role_name == current) {
                return Some(primary.role_name.as_str());
            }
            current = self
                .connections
                .iter()
                .find(|c| c.role_name == current)
                .map(|c| c.connected_to_role_name.as_str())?;
        }
        None
    }
}
