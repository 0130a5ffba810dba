//! Participant group aggregate
//!
//! One group per study deployment. It tracks who participates, which primary
//! devices the participants use and how those are registered, and the data
//! participants are expected to provide.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::mem;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::deployments::events::BusEvent;
use crate::errors::DeploymentError;
use crate::models::device::{DeviceConfiguration, DeviceRegistration};
use crate::models::protocol::{AssignedTo, StudyProtocolSnapshot};
use crate::participants::accounts::{Account, Participation, StudyInvitation};
use crate::participants::data::{ExpectedParticipantData, InputDataType, ParticipantData};

/// An account taking part in the group's study deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountParticipation {
    pub account_id: Uuid,
    pub participant_id: Uuid,
    pub assigned_roles: AssignedTo,
    pub assigned_primary_device_role_names: BTreeSet<String>,
    pub invitation: StudyInvitation,
}

/// A primary device participants use, with its current registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedPrimaryDevice {
    pub device: DeviceConfiguration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<DeviceRegistration>,
}

/// Value of one expected input, for everyone (`role: None`) or for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDataEntry {
    pub input_data_type: InputDataType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub data: Option<ParticipantData>,
}

/// Requested change of one expected input; `data: None` unsets it
pub type ParticipantDataInput = ParticipantDataEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ParticipantGroupEvent {
    ParticipationAdded {
        study_deployment_id: Uuid,
        account_id: Uuid,
        participant_id: Uuid,
    },
    DeviceRegistrationChanged {
        study_deployment_id: Uuid,
        role_name: String,
        registration: Option<DeviceRegistration>,
    },
    ParticipantDataSet {
        study_deployment_id: Uuid,
        input_data_type: InputDataType,
        role: Option<String>,
        data: Option<ParticipantData>,
    },
    StudyDeploymentStopped {
        study_deployment_id: Uuid,
    },
}

impl BusEvent for ParticipantGroupEvent {
    fn name(&self) -> &'static str {
        match self {
            ParticipantGroupEvent::ParticipationAdded { .. } => "participation_added",
            ParticipantGroupEvent::DeviceRegistrationChanged { .. } => "device_registration_changed",
            ParticipantGroupEvent::ParticipantDataSet { .. } => "participant_data_set",
            ParticipantGroupEvent::StudyDeploymentStopped { .. } => "study_deployment_stopped",
        }
    }

    fn study_deployment_id(&self) -> Uuid {
        match self {
            ParticipantGroupEvent::ParticipationAdded {
                study_deployment_id,
                ..
            }
            | ParticipantGroupEvent::DeviceRegistrationChanged {
                study_deployment_id,
                ..
            }
            | ParticipantGroupEvent::ParticipantDataSet {
                study_deployment_id,
                ..
            }
            | ParticipantGroupEvent::StudyDeploymentStopped {
                study_deployment_id,
            } => *study_deployment_id,
        }
    }
}

/// Serializable state of a [`ParticipantGroup`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantGroupSnapshot {
    pub study_deployment_id: Uuid,
    pub created_on: DateTime<Utc>,

    #[serde(default)]
    pub participations: Vec<AccountParticipation>,

    pub assigned_primary_devices: Vec<AssignedPrimaryDevice>,

    #[serde(default)]
    pub expected_data: Vec<ExpectedParticipantData>,

    #[serde(default)]
    pub data: Vec<ParticipantDataEntry>,

    #[serde(default)]
    pub is_study_deployment_stopped: bool,
}

type DataKey = (InputDataType, Option<String>);

#[derive(Debug, Clone)]
pub struct ParticipantGroup {
    study_deployment_id: Uuid,
    created_on: DateTime<Utc>,
    participations: Vec<AccountParticipation>,
    assigned_primary_devices: Vec<AssignedPrimaryDevice>,
    expected_data: Vec<ExpectedParticipantData>,
    data: BTreeMap<DataKey, Option<ParticipantData>>,
    is_study_deployment_stopped: bool,
    events: Vec<ParticipantGroupEvent>,
}

impl ParticipantGroup {
    /// Empty group for a freshly created deployment of `protocol`
    pub fn new(study_deployment_id: Uuid, protocol: &StudyProtocolSnapshot) -> Self {
        let expected_data = protocol.expected_participant_data.clone();
        let data = expected_keys(&expected_data)
            .into_iter()
            .map(|key| (key, None))
            .collect();

        Self {
            study_deployment_id,
            created_on: Utc::now(),
            participations: Vec::new(),
            assigned_primary_devices: protocol
                .primary_devices
                .iter()
                .map(|device| AssignedPrimaryDevice {
                    device: device.clone(),
                    registration: None,
                })
                .collect(),
            expected_data,
            data,
            is_study_deployment_stopped: false,
            events: Vec::new(),
        }
    }

    /// Restore a group, checking the invariants the live type upholds
    pub fn from_snapshot(snapshot: ParticipantGroupSnapshot) -> Result<Self, DeploymentError> {
        let corrupt = |message: String| {
            DeploymentError::StorageError(format!(
                "participant group {} snapshot is corrupt: {}",
                snapshot.study_deployment_id, message
            ))
        };

        let mut participant_ids = HashSet::new();
        let devices: HashSet<&str> = snapshot
            .assigned_primary_devices
            .iter()
            .map(|d| d.device.role_name.as_str())
            .collect();
        for participation in &snapshot.participations {
            if !participant_ids.insert(participation.participant_id) {
                return Err(corrupt(format!(
                    "participant {} participates twice",
                    participation.participant_id
                )));
            }
            if let Some(role) = participation
                .assigned_primary_device_role_names
                .iter()
                .find(|r| !devices.contains(r.as_str()))
            {
                return Err(corrupt(format!("unknown device '{}' is assigned", role)));
            }
        }

        let mut data: BTreeMap<DataKey, Option<ParticipantData>> = expected_keys(&snapshot.expected_data)
            .into_iter()
            .map(|key| (key, None))
            .collect();
        for entry in snapshot.data {
            let key = (entry.input_data_type, entry.role);
            match data.get_mut(&key) {
                Some(value) => *value = entry.data,
                None => {
                    return Err(corrupt(format!(
                        "data is stored for unexpected input '{}'",
                        key.0
                    )))
                }
            }
        }

        Ok(Self {
            study_deployment_id: snapshot.study_deployment_id,
            created_on: snapshot.created_on,
            participations: snapshot.participations,
            assigned_primary_devices: snapshot.assigned_primary_devices,
            expected_data: snapshot.expected_data,
            data,
            is_study_deployment_stopped: snapshot.is_study_deployment_stopped,
            events: Vec::new(),
        })
    }

    pub fn snapshot(&self) -> ParticipantGroupSnapshot {
        ParticipantGroupSnapshot {
            study_deployment_id: self.study_deployment_id,
            created_on: self.created_on,
            participations: self.participations.clone(),
            assigned_primary_devices: self.assigned_primary_devices.clone(),
            expected_data: self.expected_data.clone(),
            data: self.data(),
            is_study_deployment_stopped: self.is_study_deployment_stopped,
        }
    }

    pub fn study_deployment_id(&self) -> Uuid {
        self.study_deployment_id
    }

    pub fn participations(&self) -> &[AccountParticipation] {
        &self.participations
    }

    pub fn assigned_primary_devices(&self) -> &[AssignedPrimaryDevice] {
        &self.assigned_primary_devices
    }

    pub fn is_study_deployment_stopped(&self) -> bool {
        self.is_study_deployment_stopped
    }

    /// Current value of every expected input
    pub fn data(&self) -> Vec<ParticipantDataEntry> {
        self.data
            .iter()
            .map(|((input_data_type, role), data)| ParticipantDataEntry {
                input_data_type: input_data_type.clone(),
                role: role.clone(),
                data: data.clone(),
            })
            .collect()
    }

    pub fn consume_events(&mut self) -> Vec<ParticipantGroupEvent> {
        mem::take(&mut self.events)
    }

    /// Add `account` as a participant of the group's deployment
    pub fn add_participation(
        &mut self,
        account: &Account,
        invitation: StudyInvitation,
        participation: Participation,
    ) -> Result<(), DeploymentError> {
        if self.is_study_deployment_stopped {
            return Err(DeploymentError::Stopped(format!(
                "study deployment {} is stopped, no participants can be added",
                self.study_deployment_id
            )));
        }
        if participation.study_deployment_id != self.study_deployment_id {
            return Err(DeploymentError::InvalidArgument(format!(
                "participation in {} does not belong to study deployment {}",
                participation.study_deployment_id, self.study_deployment_id
            )));
        }
        if self
            .participations
            .iter()
            .any(|p| p.participant_id == participation.participant_id)
        {
            return Err(DeploymentError::InvalidArgument(format!(
                "participant {} already participates",
                participation.participant_id
            )));
        }
        if let Some(role) = participation
            .assigned_primary_device_role_names
            .iter()
            .find(|r| self.assigned_device(r).is_none())
        {
            return Err(DeploymentError::InvalidArgument(format!(
                "device '{}' is not part of study deployment {}",
                role, self.study_deployment_id
            )));
        }

        self.participations.push(AccountParticipation {
            account_id: account.id,
            participant_id: participation.participant_id,
            assigned_roles: participation.assigned_roles,
            assigned_primary_device_role_names: participation.assigned_primary_device_role_names,
            invitation,
        });
        self.events.push(ParticipantGroupEvent::ParticipationAdded {
            study_deployment_id: self.study_deployment_id,
            account_id: account.id,
            participant_id: participation.participant_id,
        });

        info!(
            "Account {} participates in study deployment {} as {}",
            account.id, self.study_deployment_id, participation.participant_id
        );
        Ok(())
    }

    /// Replace the registration of an assigned primary device
    ///
    /// Returns whether the registration changed.
    pub fn update_device_registration(
        &mut self,
        role_name: &str,
        registration: Option<DeviceRegistration>,
    ) -> Result<bool, DeploymentError> {
        let study_deployment_id = self.study_deployment_id;
        let device = self
            .assigned_primary_devices
            .iter_mut()
            .find(|d| d.device.role_name == role_name)
            .ok_or_else(|| {
                DeploymentError::InvalidArgument(format!(
                    "device '{}' is not assigned in study deployment {}",
                    role_name, study_deployment_id
                ))
            })?;

        if device.registration == registration {
            return Ok(false);
        }

        device.registration = registration.clone();
        self.events.push(ParticipantGroupEvent::DeviceRegistrationChanged {
            study_deployment_id,
            role_name: role_name.to_string(),
            registration,
        });
        Ok(true)
    }

    /// Set or unset one expected input
    ///
    /// `role` selects the participant role the value is for; `None` sets the
    /// value shared by everyone. Returns whether the value changed.
    pub fn set_data(
        &mut self,
        input_data_type: &InputDataType,
        data: Option<ParticipantData>,
        role: Option<&str>,
    ) -> Result<bool, DeploymentError> {
        let key = self.validate_data(input_data_type, data.as_ref(), role)?;
        Ok(self.apply_data(key, data))
    }

    /// Set several inputs at once; nothing changes when any of them is invalid
    pub fn set_data_bulk(&mut self, inputs: Vec<ParticipantDataInput>) -> Result<bool, DeploymentError> {
        let mut validated = Vec::with_capacity(inputs.len());
        for input in inputs {
            let key = self.validate_data(&input.input_data_type, input.data.as_ref(), input.role.as_deref())?;
            validated.push((key, input.data));
        }

        let mut changed = false;
        for (key, data) in validated {
            changed |= self.apply_data(key, data);
        }
        Ok(changed)
    }

    /// Mark the deployment stopped; returns `false` when it already was
    pub fn study_deployment_stopped(&mut self) -> bool {
        if self.is_study_deployment_stopped {
            return false;
        }

        self.is_study_deployment_stopped = true;
        self.events.push(ParticipantGroupEvent::StudyDeploymentStopped {
            study_deployment_id: self.study_deployment_id,
        });
        true
    }

    fn assigned_device(&self, role_name: &str) -> Option<&AssignedPrimaryDevice> {
        self.assigned_primary_devices
            .iter()
            .find(|d| d.device.role_name == role_name)
    }

    fn validate_data(
        &self,
        input_data_type: &InputDataType,
        data: Option<&ParticipantData>,
        role: Option<&str>,
    ) -> Result<DataKey, DeploymentError> {
        let key = (input_data_type.clone(), role.map(str::to_string));
        if !self.data.contains_key(&key) {
            return Err(DeploymentError::InvalidArgument(match role {
                Some(role) => format!(
                    "'{}' is not expected from participants with role '{}'",
                    input_data_type, role
                ),
                None => format!("'{}' is not expected from all participants", input_data_type),
            }));
        }

        // Unsetting is always allowed
        let Some(data) = data else {
            return Ok(key);
        };

        let element = self
            .expected_data
            .iter()
            .find(|e| e.input_data_type() == input_data_type)
            .and_then(|e| e.attribute.input_element())
            .ok_or_else(|| {
                DeploymentError::InvalidArgument(format!("'{}' has no input element", input_data_type))
            })?;
        element.validate(data).map_err(|e| {
            DeploymentError::InvalidArgument(format!("invalid value for '{}': {}", input_data_type, e))
        })?;
        Ok(key)
    }

    fn apply_data(&mut self, key: DataKey, data: Option<ParticipantData>) -> bool {
        let Some(current) = self.data.get_mut(&key) else {
            return false;
        };
        if *current == data {
            debug!("Participant data '{}' unchanged", key.0);
            return false;
        }

        *current = data.clone();
        self.events.push(ParticipantGroupEvent::ParticipantDataSet {
            study_deployment_id: self.study_deployment_id,
            input_data_type: key.0,
            role: key.1,
            data,
        });
        true
    }
}

/// Keys of the data map: one per input type assigned to everyone, and one per
/// role for input types assigned to specific roles
fn expected_keys(expected_data: &[ExpectedParticipantData]) -> BTreeSet<DataKey> {
    expected_data
        .iter()
        .flat_map(|expected| {
            let input_type = expected.input_data_type().clone();
            match &expected.assigned_to {
                AssignedTo::All => vec![(input_type, None)],
                AssignedTo::Roles(roles) => roles
                    .iter()
                    .map(|role| (input_type.clone(), Some(role.clone())))
                    .collect(),
            }
        })
        .collect()
}
