//! Study deployment aggregate
//!
//! The authoritative record of one deployed protocol: which devices
//! registered with which registration, which primary devices confirmed their
//! deployment, and whether the deployment stopped. Mutations queue
//! [`DeploymentEvent`]s which the surrounding service drains with
//! [`StudyDeployment::consume_events`] once the new state is stored.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::mem;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::deployments::events::DeploymentEvent;
use crate::deployments::readiness::{self, DependencyGraph, RedeploymentPolicy, RegistrationState};
use crate::errors::DeploymentError;
use crate::models::deployment::{ConfigurationToken, PrimaryDeviceDeployment};
use crate::models::device::{DeviceConfiguration, DeviceRegistration};
use crate::models::protocol::{AssignedTo, StudyProtocolSnapshot, TriggerConfiguration};
use crate::models::status::{
    DeploymentStatusDetails, DeviceDeploymentStatus, ParticipantStatus, StudyDeploymentStatus,
};
use crate::participants::accounts::ParticipantInvitation;

/// Serializable state of a [`StudyDeployment`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDeploymentSnapshot {
    pub id: Uuid,
    pub created_on: DateTime<Utc>,
    pub protocol: StudyProtocolSnapshot,

    #[serde(default)]
    pub policy: RedeploymentPolicy,

    #[serde(default)]
    pub registrations: BTreeMap<String, DeviceRegistration>,

    #[serde(default)]
    pub registration_history: BTreeMap<String, Vec<DeviceRegistration>>,

    #[serde(default)]
    pub registration_stamps: BTreeMap<String, u64>,

    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub deployed: BTreeSet<String>,

    #[serde(default)]
    pub invalidated: BTreeSet<String>,

    #[serde(default)]
    pub participants: Vec<ParticipantStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_on: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_on: Option<DateTime<Utc>>,
}

/// One instantiation of a protocol for a concrete group of participants
#[derive(Debug, Clone)]
pub struct StudyDeployment {
    id: Uuid,
    created_on: DateTime<Utc>,
    protocol: StudyProtocolSnapshot,
    policy: RedeploymentPolicy,
    registrations: BTreeMap<String, DeviceRegistration>,
    registration_history: BTreeMap<String, Vec<DeviceRegistration>>,
    // Version at which each device last changed its registration
    registration_stamps: BTreeMap<String, u64>,
    version: u64,
    deployed: BTreeSet<String>,
    invalidated: BTreeSet<String>,
    participants: Vec<ParticipantStatus>,
    started_on: Option<DateTime<Utc>>,
    stopped_on: Option<DateTime<Utc>>,
    events: Vec<DeploymentEvent>,
}

impl StudyDeployment {
    /// Deploy `protocol` for the invited participants
    pub fn new(
        id: Uuid,
        protocol: StudyProtocolSnapshot,
        invitations: &[ParticipantInvitation],
        policy: RedeploymentPolicy,
    ) -> Result<Self, DeploymentError> {
        protocol.validate()?;
        let participants = participant_status_list(&protocol, invitations)?;

        let mut deployment = Self {
            id,
            created_on: Utc::now(),
            protocol,
            policy,
            registrations: BTreeMap::new(),
            registration_history: BTreeMap::new(),
            registration_stamps: BTreeMap::new(),
            version: 0,
            deployed: BTreeSet::new(),
            invalidated: BTreeSet::new(),
            participants,
            started_on: None,
            stopped_on: None,
            events: Vec::new(),
        };
        deployment.events.push(DeploymentEvent::Created {
            study_deployment_id: id,
            protocol: Box::new(deployment.protocol.clone()),
            invitations: invitations.to_vec(),
        });

        info!(
            "Created study deployment {} for protocol '{}'",
            id, deployment.protocol.name
        );
        Ok(deployment)
    }

    /// Restore a deployment, checking the invariants the live type upholds
    pub fn from_snapshot(snapshot: StudyDeploymentSnapshot) -> Result<Self, DeploymentError> {
        let corrupt = |message: String| {
            DeploymentError::StorageError(format!(
                "study deployment {} snapshot is corrupt: {}",
                snapshot.id, message
            ))
        };

        snapshot
            .protocol
            .validate()
            .map_err(|e| corrupt(e.to_string()))?;

        let mut device_ids = HashSet::new();
        for (role, registration) in &snapshot.registrations {
            let device = snapshot
                .protocol
                .device(role)
                .ok_or_else(|| corrupt(format!("unknown device '{}' is registered", role)))?;
            device
                .kind
                .validate_registration(registration)
                .map_err(|e| corrupt(format!("registration of '{}': {}", role, e)))?;
            if !device_ids.insert(registration.device_id.as_str()) {
                return Err(corrupt(format!(
                    "device ID '{}' is registered twice",
                    registration.device_id
                )));
            }
        }

        for role in snapshot.deployed.iter().chain(snapshot.invalidated.iter()) {
            if !snapshot.protocol.is_primary_device(role) || !snapshot.registrations.contains_key(role) {
                return Err(corrupt(format!(
                    "'{}' is marked deployed but is not a registered primary device",
                    role
                )));
            }
        }
        if let Some(role) = snapshot.deployed.intersection(&snapshot.invalidated).next() {
            return Err(corrupt(format!("'{}' is both deployed and invalidated", role)));
        }
        if snapshot.registration_stamps.values().any(|stamp| *stamp > snapshot.version) {
            return Err(corrupt("registration stamped with a future version".to_string()));
        }

        Ok(Self {
            id: snapshot.id,
            created_on: snapshot.created_on,
            protocol: snapshot.protocol,
            policy: snapshot.policy,
            registrations: snapshot.registrations,
            registration_history: snapshot.registration_history,
            registration_stamps: snapshot.registration_stamps,
            version: snapshot.version,
            deployed: snapshot.deployed,
            invalidated: snapshot.invalidated,
            participants: snapshot.participants,
            started_on: snapshot.started_on,
            stopped_on: snapshot.stopped_on,
            events: Vec::new(),
        })
    }

    pub fn snapshot(&self) -> StudyDeploymentSnapshot {
        StudyDeploymentSnapshot {
            id: self.id,
            created_on: self.created_on,
            protocol: self.protocol.clone(),
            policy: self.policy,
            registrations: self.registrations.clone(),
            registration_history: self.registration_history.clone(),
            registration_stamps: self.registration_stamps.clone(),
            version: self.version,
            deployed: self.deployed.clone(),
            invalidated: self.invalidated.clone(),
            participants: self.participants.clone(),
            started_on: self.started_on,
            stopped_on: self.stopped_on,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn protocol(&self) -> &StudyProtocolSnapshot {
        &self.protocol
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_on.is_some()
    }

    pub fn registration(&self, role_name: &str) -> Option<&DeviceRegistration> {
        self.registrations.get(role_name)
    }

    /// Every registration a device ever registered with, oldest first
    pub fn registration_history(&self, role_name: &str) -> &[DeviceRegistration] {
        self.registration_history
            .get(role_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drain the events raised since the last call
    pub fn consume_events(&mut self) -> Vec<DeploymentEvent> {
        mem::take(&mut self.events)
    }

    /// Register a connected device while creating the deployment, before any
    /// primary device is around to do so
    pub fn preregister(
        &mut self,
        role_name: &str,
        registration: DeviceRegistration,
    ) -> Result<bool, DeploymentError> {
        if self.protocol.is_primary_device(role_name) {
            return Err(DeploymentError::InvalidArgument(format!(
                "only connected devices can be preregistered, '{}' is a primary device",
                role_name
            )));
        }
        self.register_device(role_name, registration)
    }

    /// Register `registration` for `role_name`
    ///
    /// Returns `false` when the device was already registered with the exact
    /// same registration.
    pub fn register_device(
        &mut self,
        role_name: &str,
        registration: DeviceRegistration,
    ) -> Result<bool, DeploymentError> {
        self.ensure_not_stopped()?;
        let device = self.known_device(role_name)?;
        device
            .kind
            .validate_registration(&registration)
            .map_err(|e| {
                DeploymentError::InvalidArgument(format!(
                    "invalid registration for '{}': {}",
                    role_name, e
                ))
            })?;

        if let Some(existing) = self.registrations.get(role_name) {
            if *existing == registration {
                debug!("Device '{}' already registered in {}", role_name, self.id);
                return Ok(false);
            }
            return Err(DeploymentError::InvalidState(format!(
                "device '{}' is already registered with a different registration, unregister it first",
                role_name
            )));
        }

        if let Some((other, _)) = self
            .registrations
            .iter()
            .find(|(_, r)| r.device_id == registration.device_id)
        {
            return Err(DeploymentError::InvalidArgument(format!(
                "device ID '{}' is already used by '{}'",
                registration.device_id, other
            )));
        }

        self.registrations
            .insert(role_name.to_string(), registration.clone());
        self.registration_history
            .entry(role_name.to_string())
            .or_default()
            .push(registration.clone());
        self.registration_changed(role_name, Some(registration));

        info!("Registered device '{}' in study deployment {}", role_name, self.id);
        Ok(true)
    }

    /// Remove the registration of `role_name`
    pub fn unregister_device(&mut self, role_name: &str) -> Result<(), DeploymentError> {
        self.ensure_not_stopped()?;
        self.known_device(role_name)?;
        if self.registrations.remove(role_name).is_none() {
            return Err(DeploymentError::InvalidArgument(format!(
                "device '{}' is not registered",
                role_name
            )));
        }

        self.deployed.remove(role_name);
        self.invalidated.remove(role_name);
        self.registration_changed(role_name, None);

        info!("Unregistered device '{}' in study deployment {}", role_name, self.id);
        Ok(())
    }

    /// Status of every device, primary devices first
    pub fn device_status_list(&self) -> Vec<DeviceDeploymentStatus> {
        let registered: BTreeSet<String> = self.registrations.keys().cloned().collect();
        let graph = DependencyGraph::new(&self.protocol);
        let state = RegistrationState {
            registered: &registered,
            deployed: &self.deployed,
            invalidated: &self.invalidated,
        };
        readiness::device_status_list(&graph, &state)
    }

    pub fn device_status(&self, role_name: &str) -> Option<DeviceDeploymentStatus> {
        self.device_status_list()
            .into_iter()
            .find(|s| s.role_name() == role_name)
    }

    /// Token of the configuration slice `role_name` would currently receive
    pub fn configuration_token(&self, role_name: &str) -> ConfigurationToken {
        let graph = DependencyGraph::new(&self.protocol);
        let included = graph.included_devices(role_name, RedeploymentPolicy::AnyIncludedDevice);
        let stamp = std::iter::once(role_name)
            .chain(included.iter().map(String::as_str))
            .filter_map(|role| self.registration_stamps.get(role))
            .max()
            .copied()
            .unwrap_or_default();
        ConfigurationToken(stamp)
    }

    /// Configuration slice of the primary device `role_name`
    pub fn get_device_deployment_for(
        &self,
        role_name: &str,
    ) -> Result<PrimaryDeviceDeployment, DeploymentError> {
        self.ensure_not_stopped()?;
        let device = self.known_device(role_name)?.clone();
        if !self.protocol.is_primary_device(role_name) {
            return Err(DeploymentError::InvalidArgument(format!(
                "'{}' is not a primary device, only primary devices receive a deployment",
                role_name
            )));
        }

        let can_obtain = self
            .device_status(role_name)
            .is_some_and(|s| s.can_obtain_device_deployment());
        let registration = match self.registrations.get(role_name) {
            Some(registration) if can_obtain => registration.clone(),
            _ => {
                return Err(DeploymentError::InvalidState(format!(
                    "device '{}' cannot obtain its deployment yet",
                    role_name
                )))
            }
        };

        let graph = DependencyGraph::new(&self.protocol);
        let connected_devices: Vec<DeviceConfiguration> =
            graph.connected_devices(role_name).into_iter().cloned().collect();

        let mut targets: BTreeSet<&str> = connected_devices.iter().map(|d| d.role_name.as_str()).collect();
        targets.insert(role_name);

        let task_controls: Vec<_> = self
            .protocol
            .task_controls
            .iter()
            .filter(|c| targets.contains(c.destination_device_role_name.as_str()))
            .cloned()
            .collect();
        let triggers: BTreeMap<u32, TriggerConfiguration> = task_controls
            .iter()
            .filter_map(|c| {
                self.protocol
                    .triggers
                    .get(&c.trigger_id)
                    .map(|t| (c.trigger_id, t.clone()))
            })
            .collect();
        let tasks = self
            .protocol
            .tasks
            .iter()
            .filter(|t| task_controls.iter().any(|c| c.task_name == t.name))
            .cloned()
            .collect();
        let connected_device_registrations = connected_devices
            .iter()
            .filter_map(|d| {
                self.registrations
                    .get(&d.role_name)
                    .map(|r| (d.role_name.clone(), r.clone()))
            })
            .collect();

        Ok(PrimaryDeviceDeployment {
            device_configuration: device,
            registration,
            connected_devices,
            connected_device_registrations,
            tasks,
            triggers,
            task_controls,
            application_data: self.protocol.application_data.clone(),
            last_update: self.configuration_token(role_name),
        })
    }

    /// Mark `role_name` as deployed with the configuration identified by `token`
    pub fn device_deployed(
        &mut self,
        role_name: &str,
        token: ConfigurationToken,
    ) -> Result<(), DeploymentError> {
        self.ensure_not_stopped()?;
        self.known_device(role_name)?;
        if !self.protocol.is_primary_device(role_name) {
            return Err(DeploymentError::InvalidArgument(format!(
                "'{}' is not a primary device and is never deployed",
                role_name
            )));
        }

        let current = self.configuration_token(role_name);
        let stale = || {
            DeploymentError::InvalidState(format!(
                "configuration {} of '{}' is outdated, the current one is {}",
                token, role_name, current
            ))
        };

        if self.deployed.contains(role_name) {
            return if token == current { Ok(()) } else { Err(stale()) };
        }

        let can_deploy = self
            .device_status(role_name)
            .is_some_and(|s| s.can_deploy());
        if !can_deploy {
            return Err(DeploymentError::InvalidState(format!(
                "device '{}' cannot be deployed yet",
                role_name
            )));
        }
        if token != current {
            return Err(stale());
        }

        self.invalidated.remove(role_name);
        self.deployed.insert(role_name.to_string());
        self.events.push(DeploymentEvent::DeviceDeployed {
            study_deployment_id: self.id,
            role_name: role_name.to_string(),
            token,
        });
        info!(
            "Device '{}' deployed in study deployment {} with configuration {}",
            role_name, self.id, token
        );

        self.update_started();
        Ok(())
    }

    /// Stop the deployment for good; returns `false` when already stopped
    pub fn stop(&mut self) -> bool {
        if self.is_stopped() {
            return false;
        }

        self.stopped_on = Some(Utc::now());
        self.events.push(DeploymentEvent::Stopped {
            study_deployment_id: self.id,
        });
        info!("Stopped study deployment {}", self.id);
        true
    }

    pub fn status(&self) -> StudyDeploymentStatus {
        let device_status_list = self.device_status_list();
        let all_deployed = readiness::all_required_devices_deployed(&device_status_list);
        let any_primary_registered = self
            .protocol
            .primary_devices
            .iter()
            .any(|d| self.registrations.contains_key(&d.role_name));

        let details = DeploymentStatusDetails {
            study_deployment_id: self.id,
            created_on: self.created_on,
            device_status_list,
            participant_status_list: self.participants.clone(),
            started_on: self.started_on,
        };

        if self.is_stopped() {
            StudyDeploymentStatus::Stopped(details)
        } else if all_deployed {
            StudyDeploymentStatus::Running(details)
        } else if !any_primary_registered {
            StudyDeploymentStatus::Invited(details)
        } else {
            StudyDeploymentStatus::DeployingDevices(details)
        }
    }

    fn ensure_not_stopped(&self) -> Result<(), DeploymentError> {
        if self.is_stopped() {
            return Err(DeploymentError::Stopped(format!(
                "study deployment {} is stopped",
                self.id
            )));
        }
        Ok(())
    }

    fn known_device(&self, role_name: &str) -> Result<&DeviceConfiguration, DeploymentError> {
        self.protocol.device(role_name).ok_or_else(|| {
            DeploymentError::InvalidArgument(format!(
                "device '{}' is not part of study deployment {}",
                role_name, self.id
            ))
        })
    }

    fn registration_changed(&mut self, role_name: &str, registration: Option<DeviceRegistration>) {
        self.version += 1;
        self.registration_stamps
            .insert(role_name.to_string(), self.version);
        self.events.push(DeploymentEvent::DeviceRegistrationChanged {
            study_deployment_id: self.id,
            role_name: role_name.to_string(),
            registration,
        });

        let dependents = DependencyGraph::new(&self.protocol).dependents_of(role_name, self.policy);
        for dependent in dependents {
            if self.deployed.remove(&dependent) {
                info!(
                    "Device '{}' needs redeployment after '{}' changed",
                    dependent, role_name
                );
                self.invalidated.insert(dependent.clone());
                self.events.push(DeploymentEvent::DeploymentInvalidated {
                    study_deployment_id: self.id,
                    role_name: dependent,
                });
            }
        }

        self.update_started();
    }

    fn update_started(&mut self) {
        if self.started_on.is_some() || self.is_stopped() {
            return;
        }
        if readiness::all_required_devices_deployed(&self.device_status_list()) {
            let started_on = Utc::now();
            self.started_on = Some(started_on);
            self.events.push(DeploymentEvent::Started {
                study_deployment_id: self.id,
                started_on,
            });
        }
    }
}

/// Participants of a new deployment and the primary devices they use
fn participant_status_list(
    protocol: &StudyProtocolSnapshot,
    invitations: &[ParticipantInvitation],
) -> Result<Vec<ParticipantStatus>, DeploymentError> {
    let invalid = |message: String| Err(DeploymentError::InvalidArgument(message));

    if invitations.is_empty() {
        return invalid("at least one participant needs to be invited".to_string());
    }

    let known_roles: HashSet<&str> = protocol
        .participant_roles
        .iter()
        .map(|r| r.role.as_str())
        .collect();
    let mut participant_ids = HashSet::new();
    let mut held_roles = HashSet::new();
    let mut assigned_devices = BTreeSet::new();
    let mut participants = Vec::with_capacity(invitations.len());

    for invitation in invitations {
        if !participant_ids.insert(invitation.participant_id) {
            return invalid(format!(
                "participant {} is invited twice",
                invitation.participant_id
            ));
        }
        match &invitation.assigned_roles {
            AssignedTo::All => held_roles.extend(known_roles.iter().copied()),
            AssignedTo::Roles(roles) => {
                if let Some(role) = roles.iter().find(|r| !known_roles.contains(r.as_str())) {
                    return invalid(format!("participant role '{}' is not part of the protocol", role));
                }
                held_roles.extend(roles.iter().map(String::as_str));
            }
        }

        let devices = protocol.primary_devices_assigned_to(&invitation.assigned_roles);
        assigned_devices.extend(devices.iter().cloned());
        participants.push(ParticipantStatus {
            participant_id: invitation.participant_id,
            assigned_primary_device_role_names: devices,
        });
    }

    if let Some(device) = protocol
        .primary_devices
        .iter()
        .find(|d| !d.is_optional && !assigned_devices.contains(&d.role_name))
    {
        return invalid(format!(
            "primary device '{}' is not used by any invited participant",
            device.role_name
        ));
    }
    if let Some(role) = protocol
        .participant_roles
        .iter()
        .find(|r| !r.is_optional && !held_roles.contains(r.role.as_str()))
    {
        return invalid(format!("participant role '{}' is not assigned to anyone", role.role));
    }

    Ok(participants)
}
