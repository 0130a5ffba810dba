//! Accounts and participation invitations

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::DeploymentError;
use crate::models::device::DeviceConfiguration;
use crate::models::protocol::AssignedTo;

/// How an account is identified towards the account service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "identity", rename_all = "snake_case")]
pub enum AccountIdentity {
    EmailAddress { email_address: String },
    Username { username: String },
}

impl AccountIdentity {
    pub fn email(email_address: impl Into<String>) -> Self {
        AccountIdentity::EmailAddress {
            email_address: email_address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub identity: AccountIdentity,
}

/// What participants are told about the study they are invited to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyInvitation {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_data: Option<String>,
}

impl StudyInvitation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            application_data: None,
        }
    }
}

/// Invitation of one participant, handed over when a deployment is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInvitation {
    pub participant_id: Uuid,
    pub assigned_roles: AssignedTo,
    pub identity: AccountIdentity,
    pub invitation: StudyInvitation,
}

/// Participation of a participant in a study deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub study_deployment_id: Uuid,
    pub participant_id: Uuid,
    pub assigned_roles: AssignedTo,
    pub assigned_primary_device_role_names: BTreeSet<String>,
}

/// A participation an account was invited to and has not left
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveParticipationInvitation {
    pub participation: Participation,
    pub invitation: StudyInvitation,
    pub assigned_devices: Vec<DeviceConfiguration>,
}

/// Account management, consumed while building participant groups only
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn find_account(&self, identity: &AccountIdentity) -> Result<Option<Account>, DeploymentError>;

    /// Create an account for `identity` and send it the invitation
    async fn invite_new_account(
        &self,
        identity: &AccountIdentity,
        invitation: &StudyInvitation,
        participation: &Participation,
        devices: &[DeviceConfiguration],
    ) -> Result<Account, DeploymentError>;

    async fn invite_existing_account(
        &self,
        account_id: Uuid,
        invitation: &StudyInvitation,
        participation: &Participation,
        devices: &[DeviceConfiguration],
    ) -> Result<(), DeploymentError>;
}

/// Account service keeping accounts and invitations in memory
#[derive(Default)]
pub struct InMemoryAccountService {
    accounts: RwLock<HashMap<Uuid, Account>>,
    invitations: RwLock<HashMap<Uuid, Vec<ActiveParticipationInvitation>>>,
}

impl InMemoryAccountService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account which exists before any invitation
    pub fn add_account(&self, identity: AccountIdentity) -> Account {
        let account = Account {
            id: Uuid::new_v4(),
            identity,
        };
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        accounts.insert(account.id, account.clone());
        account
    }

    /// Invitations sent to `account_id`
    pub fn invitations_for(&self, account_id: Uuid) -> Vec<ActiveParticipationInvitation> {
        let invitations = self.invitations.read().unwrap_or_else(|e| e.into_inner());
        invitations.get(&account_id).cloned().unwrap_or_default()
    }

    fn record_invitation(
        &self,
        account_id: Uuid,
        invitation: &StudyInvitation,
        participation: &Participation,
        devices: &[DeviceConfiguration],
    ) {
        let mut invitations = self.invitations.write().unwrap_or_else(|e| e.into_inner());
        invitations
            .entry(account_id)
            .or_default()
            .push(ActiveParticipationInvitation {
                participation: participation.clone(),
                invitation: invitation.clone(),
                assigned_devices: devices.to_vec(),
            });
    }
}

#[async_trait]
impl AccountService for InMemoryAccountService {
    async fn find_account(&self, identity: &AccountIdentity) -> Result<Option<Account>, DeploymentError> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        Ok(accounts.values().find(|a| &a.identity == identity).cloned())
    }

    async fn invite_new_account(
        &self,
        identity: &AccountIdentity,
        invitation: &StudyInvitation,
        participation: &Participation,
        devices: &[DeviceConfiguration],
    ) -> Result<Account, DeploymentError> {
        if self.find_account(identity).await?.is_some() {
            return Err(DeploymentError::InvalidArgument(format!(
                "an account for {:?} already exists",
                identity
            )));
        }

        let account = self.add_account(identity.clone());
        info!(
            "Invited new account {} to study deployment {}",
            account.id, participation.study_deployment_id
        );
        self.record_invitation(account.id, invitation, participation, devices);
        Ok(account)
    }

    async fn invite_existing_account(
        &self,
        account_id: Uuid,
        invitation: &StudyInvitation,
        participation: &Participation,
        devices: &[DeviceConfiguration],
    ) -> Result<(), DeploymentError> {
        let exists = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts.contains_key(&account_id)
        };
        if !exists {
            return Err(DeploymentError::InvalidArgument(format!(
                "account {} does not exist",
                account_id
            )));
        }

        info!(
            "Invited account {} to study deployment {}",
            account_id, participation.study_deployment_id
        );
        self.record_invitation(account_id, invitation, participation, devices);
        Ok(())
    }
}
