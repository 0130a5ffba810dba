//! Local state of one study on this device

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DeploymentError;
use crate::models::deployment::PrimaryDeviceDeployment;
use crate::models::device::DeviceRegistration;
use crate::models::status::{DeviceDeploymentStatus, StudyDeploymentStatus};

/// Identifies a study on a device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StudyKey {
    pub study_deployment_id: Uuid,
    pub device_role_name: String,
}

impl StudyKey {
    pub fn new(study_deployment_id: Uuid, device_role_name: impl Into<String>) -> Self {
        Self {
            study_deployment_id,
            device_role_name: device_role_name.into(),
        }
    }
}

impl std::fmt::Display for StudyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.study_deployment_id, self.device_role_name)
    }
}

/// Where a study stands from this device's point of view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StudyStatus {
    /// This device did not register yet
    DeploymentNotStarted,

    /// Other devices need to register first
    AwaitingOtherDeviceRegistrations { remaining_devices: BTreeSet<String> },

    /// This device can retrieve, validate and confirm its deployment
    AwaitingDeviceDeployment,

    /// This device is deployed; other devices are not
    AwaitingOtherDeviceDeployments,

    Running,

    Stopped,
}

impl StudyStatus {
    pub fn name(&self) -> &'static str {
        match self {
            StudyStatus::DeploymentNotStarted => "deployment_not_started",
            StudyStatus::AwaitingOtherDeviceRegistrations { .. } => "awaiting_other_device_registrations",
            StudyStatus::AwaitingDeviceDeployment => "awaiting_device_deployment",
            StudyStatus::AwaitingOtherDeviceDeployments => "awaiting_other_device_deployments",
            StudyStatus::Running => "running",
            StudyStatus::Stopped => "stopped",
        }
    }

    /// Whether the study reached a state it only leaves through the host.
    /// A `Stopped` study is kept, with that status, until it is removed
    /// with `ClientManager::remove_study`.
    pub fn is_settled(&self) -> bool {
        matches!(self, StudyStatus::Running | StudyStatus::Stopped)
    }
}

/// Input driving a [`ClientStudy`] forward
#[derive(Debug, Clone)]
pub enum StudyEvent {
    /// The device (re)registered with this registration
    Registered(DeviceRegistration),

    /// The host no longer knows the device by its last registration
    Unregistered,

    /// Fresh status of the deployment
    StatusReceived(StudyDeploymentStatus),

    /// Configuration slice of this device
    DeploymentReceived(PrimaryDeviceDeployment),

    /// The host accepted the deployment of this device
    Deployed(StudyDeploymentStatus),
}

/// Serializable state of a [`ClientStudy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySnapshot {
    pub study_deployment_id: Uuid,
    pub device_role_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<DeviceRegistration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_status: Option<StudyDeploymentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_deployment: Option<PrimaryDeviceDeployment>,

    #[serde(default)]
    pub is_deployed: bool,
}

/// A study this device participates in
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStudy {
    key: StudyKey,
    registration: Option<DeviceRegistration>,
    deployment_status: Option<StudyDeploymentStatus>,
    device_deployment: Option<PrimaryDeviceDeployment>,
    is_deployed: bool,
}

impl ClientStudy {
    pub fn new(key: StudyKey) -> Self {
        Self {
            key,
            registration: None,
            deployment_status: None,
            device_deployment: None,
            is_deployed: false,
        }
    }

    pub fn from_snapshot(snapshot: StudySnapshot) -> Result<Self, DeploymentError> {
        let mut study = Self::new(StudyKey::new(
            snapshot.study_deployment_id,
            snapshot.device_role_name,
        ));
        study.registration = snapshot.registration;

        if let Some(status) = snapshot.deployment_status {
            study.accept_status(status)?;
        }
        if let Some(deployment) = snapshot.device_deployment {
            study.check_addressed_to_me(&deployment)?;
            study.device_deployment = Some(deployment);
        }
        if snapshot.is_deployed && study.device_deployment.is_none() {
            return Err(DeploymentError::StorageError(format!(
                "study {} is deployed without a deployment",
                study.key
            )));
        }
        study.is_deployed = snapshot.is_deployed;
        Ok(study)
    }

    pub fn snapshot(&self) -> StudySnapshot {
        StudySnapshot {
            study_deployment_id: self.key.study_deployment_id,
            device_role_name: self.key.device_role_name.clone(),
            registration: self.registration.clone(),
            deployment_status: self.deployment_status.clone(),
            device_deployment: self.device_deployment.clone(),
            is_deployed: self.is_deployed,
        }
    }

    pub fn key(&self) -> &StudyKey {
        &self.key
    }

    pub fn registration(&self) -> Option<&DeviceRegistration> {
        self.registration.as_ref()
    }

    pub fn deployment_status(&self) -> Option<&StudyDeploymentStatus> {
        self.deployment_status.as_ref()
    }

    pub fn device_deployment(&self) -> Option<&PrimaryDeviceDeployment> {
        self.device_deployment.as_ref()
    }

    pub fn is_deployed(&self) -> bool {
        self.is_deployed
    }

    /// Status of this device as last reported by the host
    pub fn device_status(&self) -> Option<&DeviceDeploymentStatus> {
        self.deployment_status
            .as_ref()
            .and_then(|s| s.device_status(&self.key.device_role_name))
    }

    pub fn status(&self) -> StudyStatus {
        let Some(deployment_status) = &self.deployment_status else {
            return StudyStatus::DeploymentNotStarted;
        };
        if deployment_status.is_stopped() {
            return StudyStatus::Stopped;
        }

        match self.device_status() {
            None | Some(DeviceDeploymentStatus::Unregistered { .. }) => StudyStatus::DeploymentNotStarted,
            Some(DeviceDeploymentStatus::Deployed { .. }) => {
                if deployment_status.is_running() {
                    StudyStatus::Running
                } else {
                    StudyStatus::AwaitingOtherDeviceDeployments
                }
            }
            Some(
                status @ (DeviceDeploymentStatus::Registered { readiness, .. }
                | DeviceDeploymentStatus::NeedsRedeployment { readiness, .. }),
            ) => {
                if !readiness.requires_deployment {
                    // Devices without a deployment of their own only wait for the study
                    return if deployment_status.is_running() {
                        StudyStatus::Running
                    } else {
                        StudyStatus::AwaitingOtherDeviceDeployments
                    };
                }
                if status.can_obtain_device_deployment() && status.can_deploy() {
                    return StudyStatus::AwaitingDeviceDeployment;
                }

                let mut remaining_devices = readiness
                    .remaining_devices_to_register_to_obtain_deployment
                    .clone();
                remaining_devices.extend(
                    readiness
                        .remaining_devices_to_register_before_deployment
                        .iter()
                        .cloned(),
                );
                StudyStatus::AwaitingOtherDeviceRegistrations { remaining_devices }
            }
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StudyEvent) -> Result<(), DeploymentError> {
        match event {
            StudyEvent::Registered(registration) => {
                if self.registration.as_ref() != Some(&registration) {
                    // Whatever was validated before no longer applies
                    self.device_deployment = None;
                    self.is_deployed = false;
                }
                self.registration = Some(registration);
                Ok(())
            }
            StudyEvent::Unregistered => {
                self.registration = None;
                self.device_deployment = None;
                self.is_deployed = false;
                Ok(())
            }
            StudyEvent::StatusReceived(status) => self.accept_status(status),
            StudyEvent::DeploymentReceived(deployment) => {
                self.check_addressed_to_me(&deployment)?;
                if self.is_deployed && self.device_deployment.as_ref() != Some(&deployment) {
                    self.is_deployed = false;
                }
                self.device_deployment = Some(deployment);
                Ok(())
            }
            StudyEvent::Deployed(status) => {
                if self.device_deployment.is_none() {
                    return Err(DeploymentError::InvalidState(format!(
                        "study {} cannot be deployed before receiving its deployment",
                        self.key
                    )));
                }
                self.accept_status(status)?;
                self.is_deployed = true;
                Ok(())
            }
        }
    }

    fn accept_status(&mut self, status: StudyDeploymentStatus) -> Result<(), DeploymentError> {
        if status.study_deployment_id() != self.key.study_deployment_id {
            return Err(DeploymentError::Inconsistent(format!(
                "received status of {} for study {}",
                status.study_deployment_id(),
                self.key
            )));
        }

        self.deployment_status = Some(status);
        let deployed_remotely = matches!(
            self.device_status(),
            Some(DeviceDeploymentStatus::Deployed { .. })
        );
        if self.is_deployed && !deployed_remotely && !self.status().is_settled() {
            // The host invalidated the deployment; fetch and validate again
            self.is_deployed = false;
            self.device_deployment = None;
        }
        Ok(())
    }

    fn check_addressed_to_me(&self, deployment: &PrimaryDeviceDeployment) -> Result<(), DeploymentError> {
        if deployment.role_name() != self.key.device_role_name {
            return Err(DeploymentError::Inconsistent(format!(
                "received deployment for '{}' while deploying '{}'",
                deployment.role_name(),
                self.key.device_role_name
            )));
        }
        Ok(())
    }
}
