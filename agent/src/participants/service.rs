//! Participation service
//!
//! Builds a participant group when a study deployment is created and keeps it
//! in step with the deployment afterwards, driven by [`DeploymentEvent`]s.
//! Events raised by the groups are broadcast once the group is stored.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::deployments::events::{DeploymentEvent, DeploymentEventHandler, EventBus};
use crate::errors::DeploymentError;
use crate::models::device::DeviceConfiguration;
use crate::models::protocol::StudyProtocolSnapshot;
use crate::participants::accounts::{
    AccountService, ActiveParticipationInvitation, ParticipantInvitation, Participation,
};
use crate::participants::group::{ParticipantDataEntry, ParticipantDataInput, ParticipantGroup, ParticipantGroupEvent};
use crate::participants::repository::ParticipantGroupRepository;

pub struct ParticipationService {
    groups: Arc<dyn ParticipantGroupRepository>,
    accounts: Arc<dyn AccountService>,
    events: EventBus<ParticipantGroupEvent>,
    // Serialises read-modify-write cycles on groups
    write_lock: Mutex<()>,
}

impl ParticipationService {
    pub fn new(groups: Arc<dyn ParticipantGroupRepository>, accounts: Arc<dyn AccountService>) -> Self {
        Self {
            groups,
            accounts,
            events: EventBus::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn events(&self) -> &EventBus<ParticipantGroupEvent> {
        &self.events
    }

    /// Apply a deployment event to the affected participant group
    async fn apply(&self, event: &DeploymentEvent) -> Result<(), DeploymentError> {
        let _guard = self.write_lock.lock().await;

        match event {
            DeploymentEvent::Created {
                study_deployment_id,
                protocol,
                invitations,
            } => self.create_group(*study_deployment_id, protocol, invitations).await,
            DeploymentEvent::Removed {
                study_deployment_id,
            } => {
                if self.groups.remove(*study_deployment_id).await? {
                    info!("Removed participant group of {}", study_deployment_id);
                }
                Ok(())
            }
            DeploymentEvent::DeviceRegistrationChanged {
                study_deployment_id,
                role_name,
                registration,
            } => {
                let Some(mut group) = self.groups.get(*study_deployment_id).await? else {
                    warn!("No participant group for study deployment {}", study_deployment_id);
                    return Ok(());
                };
                // Connected devices are not assigned to participants
                if !group
                    .assigned_primary_devices()
                    .iter()
                    .any(|d| &d.device.role_name == role_name)
                {
                    return Ok(());
                }
                if group.update_device_registration(role_name, registration.clone())? {
                    self.store(&mut group).await?;
                }
                Ok(())
            }
            DeploymentEvent::Stopped {
                study_deployment_id,
            } => {
                let Some(mut group) = self.groups.get(*study_deployment_id).await? else {
                    return Ok(());
                };
                if group.study_deployment_stopped() {
                    self.store(&mut group).await?;
                }
                Ok(())
            }
            DeploymentEvent::DeviceDeployed { .. }
            | DeploymentEvent::DeploymentInvalidated { .. }
            | DeploymentEvent::Started { .. } => Ok(()),
        }
    }

    /// Invitations to running or pending deployments `account_id` takes part in
    pub async fn get_active_participation_invitations(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ActiveParticipationInvitation>, DeploymentError> {
        let groups = self.groups.find_by_account(account_id).await?;

        Ok(groups
            .iter()
            .filter(|group| !group.is_study_deployment_stopped())
            .flat_map(move |group| {
                group
                    .participations()
                    .iter()
                    .filter(move |p| p.account_id == account_id)
                    .map(move |p| ActiveParticipationInvitation {
                        participation: Participation {
                            study_deployment_id: group.study_deployment_id(),
                            participant_id: p.participant_id,
                            assigned_roles: p.assigned_roles.clone(),
                            assigned_primary_device_role_names: p
                                .assigned_primary_device_role_names
                                .clone(),
                        },
                        invitation: p.invitation.clone(),
                        assigned_devices: group
                            .assigned_primary_devices()
                            .iter()
                            .filter(|d| p.assigned_primary_device_role_names.contains(&d.device.role_name))
                            .map(|d| d.device.clone())
                            .collect(),
                    })
            })
            .collect())
    }

    pub async fn get_participant_data(
        &self,
        study_deployment_id: Uuid,
    ) -> Result<Vec<ParticipantDataEntry>, DeploymentError> {
        Ok(self.group(study_deployment_id).await?.data())
    }

    /// Set participant data, returning the resulting data of the group
    pub async fn set_participant_data(
        &self,
        study_deployment_id: Uuid,
        inputs: Vec<ParticipantDataInput>,
    ) -> Result<Vec<ParticipantDataEntry>, DeploymentError> {
        let _guard = self.write_lock.lock().await;

        let mut group = self.group(study_deployment_id).await?;
        if group.set_data_bulk(inputs)? {
            self.store(&mut group).await?;
        }
        Ok(group.data())
    }

    async fn group(&self, study_deployment_id: Uuid) -> Result<ParticipantGroup, DeploymentError> {
        self.groups.get(study_deployment_id).await?.ok_or_else(|| {
            DeploymentError::InvalidArgument(format!(
                "study deployment {} has no participant group",
                study_deployment_id
            ))
        })
    }

    async fn store(&self, group: &mut ParticipantGroup) -> Result<(), DeploymentError> {
        self.groups.update(group).await?;
        self.events.publish(group.consume_events());
        Ok(())
    }

    async fn create_group(
        &self,
        study_deployment_id: Uuid,
        protocol: &StudyProtocolSnapshot,
        invitations: &[ParticipantInvitation],
    ) -> Result<(), DeploymentError> {
        let mut group = ParticipantGroup::new(study_deployment_id, protocol);

        for invitation in invitations {
            let assigned = protocol.primary_devices_assigned_to(&invitation.assigned_roles);
            let devices: Vec<DeviceConfiguration> = protocol
                .primary_devices
                .iter()
                .filter(|d| assigned.contains(&d.role_name))
                .cloned()
                .collect();
            let participation = Participation {
                study_deployment_id,
                participant_id: invitation.participant_id,
                assigned_roles: invitation.assigned_roles.clone(),
                assigned_primary_device_role_names: assigned,
            };

            let account = match self.accounts.find_account(&invitation.identity).await? {
                Some(account) => {
                    self.accounts
                        .invite_existing_account(account.id, &invitation.invitation, &participation, &devices)
                        .await?;
                    account
                }
                None => {
                    self.accounts
                        .invite_new_account(&invitation.identity, &invitation.invitation, &participation, &devices)
                        .await?
                }
            };

            group.add_participation(&account, invitation.invitation.clone(), participation)?;
        }

        self.groups.add(&group).await?;
        self.events.publish(group.consume_events());
        info!(
            "Created participant group of {} with {} participant(s)",
            study_deployment_id,
            invitations.len()
        );
        Ok(())
    }
}

#[async_trait]
impl DeploymentEventHandler for ParticipationService {
    async fn handle_deployment_event(&self, event: &DeploymentEvent) -> Result<(), DeploymentError> {
        self.apply(event).await
    }
}
