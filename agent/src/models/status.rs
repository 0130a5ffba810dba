//! Deployment statuses reported by the deployment host

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::device::DeviceConfiguration;

/// Readiness of a device which is not yet deployed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReadiness {
    /// Primary devices need to be deployed; connected devices only registered
    pub requires_deployment: bool,

    /// Other devices which need to register before this device can retrieve
    /// its deployment
    pub remaining_devices_to_register_to_obtain_deployment: BTreeSet<String>,

    /// Other devices which need to register before this device can be deployed
    pub remaining_devices_to_register_before_deployment: BTreeSet<String>,
}

/// Deployment status of a single device in a study deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceDeploymentStatus {
    /// No registration received
    Unregistered {
        device: DeviceConfiguration,
        #[serde(flatten)]
        readiness: DeviceReadiness,
    },

    /// Registration received, deployment not yet confirmed
    Registered {
        device: DeviceConfiguration,
        #[serde(flatten)]
        readiness: DeviceReadiness,
    },

    /// Deployment retrieved, validated and confirmed by the device
    Deployed { device: DeviceConfiguration },

    /// Deployed before, but a device it depends on changed since
    NeedsRedeployment {
        device: DeviceConfiguration,
        #[serde(flatten)]
        readiness: DeviceReadiness,
    },
}

impl DeviceDeploymentStatus {
    pub fn device(&self) -> &DeviceConfiguration {
        match self {
            DeviceDeploymentStatus::Unregistered { device, .. }
            | DeviceDeploymentStatus::Registered { device, .. }
            | DeviceDeploymentStatus::Deployed { device }
            | DeviceDeploymentStatus::NeedsRedeployment { device, .. } => device,
        }
    }

    pub fn role_name(&self) -> &str {
        &self.device().role_name
    }

    /// Readiness details; `None` once deployed
    pub fn readiness(&self) -> Option<&DeviceReadiness> {
        match self {
            DeviceDeploymentStatus::Unregistered { readiness, .. }
            | DeviceDeploymentStatus::Registered { readiness, .. }
            | DeviceDeploymentStatus::NeedsRedeployment { readiness, .. } => Some(readiness),
            DeviceDeploymentStatus::Deployed { .. } => None,
        }
    }

    /// Whether the device may retrieve its deployment: it is registered, needs
    /// a deployment, and every device it depends on is registered
    pub fn can_obtain_device_deployment(&self) -> bool {
        match self {
            DeviceDeploymentStatus::Unregistered { .. } => false,
            DeviceDeploymentStatus::Deployed { .. } => true,
            DeviceDeploymentStatus::Registered { readiness, .. }
            | DeviceDeploymentStatus::NeedsRedeployment { readiness, .. } => {
                readiness.requires_deployment
                    && readiness
                        .remaining_devices_to_register_to_obtain_deployment
                        .is_empty()
            }
        }
    }

    /// Whether the device may be marked deployed
    pub fn can_deploy(&self) -> bool {
        match self {
            DeviceDeploymentStatus::Unregistered { .. } | DeviceDeploymentStatus::Deployed { .. } => false,
            DeviceDeploymentStatus::Registered { readiness, .. }
            | DeviceDeploymentStatus::NeedsRedeployment { readiness, .. } => {
                readiness.requires_deployment
                    && readiness
                        .remaining_devices_to_register_before_deployment
                        .is_empty()
            }
        }
    }

    pub fn requires_deployment(&self) -> bool {
        match self {
            DeviceDeploymentStatus::Deployed { .. } => true,
            _ => self.readiness().is_some_and(|r| r.requires_deployment),
        }
    }

    pub fn is_registered(&self) -> bool {
        !matches!(self, DeviceDeploymentStatus::Unregistered { .. })
    }

    /// Devices which still need to register before this one can be deployed
    pub fn remaining_devices_to_register_before_deployment(&self) -> BTreeSet<String> {
        self.readiness()
            .map(|r| r.remaining_devices_to_register_before_deployment.clone())
            .unwrap_or_default()
    }
}

/// Participation status of a participant in a study deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub participant_id: Uuid,
    pub assigned_primary_device_role_names: BTreeSet<String>,
}

/// Details shared by every study deployment status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatusDetails {
    pub study_deployment_id: Uuid,
    pub created_on: DateTime<Utc>,
    pub device_status_list: Vec<DeviceDeploymentStatus>,
    #[serde(default)]
    pub participant_status_list: Vec<ParticipantStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_on: Option<DateTime<Utc>>,
}

/// Overall status of a study deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StudyDeploymentStatus {
    /// Created; no device registered yet
    Invited(DeploymentStatusDetails),

    /// Some devices registered, not all required devices deployed
    DeployingDevices(DeploymentStatusDetails),

    /// All required devices deployed
    Running(DeploymentStatusDetails),

    /// Stopped for good
    Stopped(DeploymentStatusDetails),
}

impl StudyDeploymentStatus {
    pub fn details(&self) -> &DeploymentStatusDetails {
        match self {
            StudyDeploymentStatus::Invited(details)
            | StudyDeploymentStatus::DeployingDevices(details)
            | StudyDeploymentStatus::Running(details)
            | StudyDeploymentStatus::Stopped(details) => details,
        }
    }

    pub fn study_deployment_id(&self) -> Uuid {
        self.details().study_deployment_id
    }

    pub fn device_status(&self, role_name: &str) -> Option<&DeviceDeploymentStatus> {
        self.details()
            .device_status_list
            .iter()
            .find(|s| s.role_name() == role_name)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, StudyDeploymentStatus::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, StudyDeploymentStatus::Stopped(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            StudyDeploymentStatus::Invited(_) => "invited",
            StudyDeploymentStatus::DeployingDevices(_) => "deploying_devices",
            StudyDeploymentStatus::Running(_) => "running",
            StudyDeploymentStatus::Stopped(_) => "stopped",
        }
    }
}
