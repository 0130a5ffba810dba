//! Storage of participant groups

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::DeploymentError;
use crate::participants::group::{ParticipantGroup, ParticipantGroupSnapshot};

#[async_trait]
pub trait ParticipantGroupRepository: Send + Sync {
    /// Add the group of a new deployment; fails when one exists already
    async fn add(&self, group: &ParticipantGroup) -> Result<(), DeploymentError>;

    async fn get(&self, study_deployment_id: Uuid) -> Result<Option<ParticipantGroup>, DeploymentError>;

    /// Groups in which `account_id` participates
    async fn find_by_account(&self, account_id: Uuid) -> Result<Vec<ParticipantGroup>, DeploymentError>;

    async fn update(&self, group: &ParticipantGroup) -> Result<(), DeploymentError>;

    /// Returns whether a group was removed
    async fn remove(&self, study_deployment_id: Uuid) -> Result<bool, DeploymentError>;
}

#[derive(Default)]
pub struct InMemoryParticipantGroupRepository {
    snapshots: RwLock<HashMap<Uuid, ParticipantGroupSnapshot>>,
}

impl InMemoryParticipantGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParticipantGroupRepository for InMemoryParticipantGroupRepository {
    async fn add(&self, group: &ParticipantGroup) -> Result<(), DeploymentError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        let id = group.study_deployment_id();
        if snapshots.contains_key(&id) {
            return Err(DeploymentError::InvalidArgument(format!(
                "participant group of study deployment {} already exists",
                id
            )));
        }
        snapshots.insert(id, group.snapshot());
        Ok(())
    }

    async fn get(&self, study_deployment_id: Uuid) -> Result<Option<ParticipantGroup>, DeploymentError> {
        let snapshot = {
            let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
            snapshots.get(&study_deployment_id).cloned()
        };
        snapshot.map(ParticipantGroup::from_snapshot).transpose()
    }

    async fn find_by_account(&self, account_id: Uuid) -> Result<Vec<ParticipantGroup>, DeploymentError> {
        let found: Vec<ParticipantGroupSnapshot> = {
            let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
            snapshots
                .values()
                .filter(|s| s.participations.iter().any(|p| p.account_id == account_id))
                .cloned()
                .collect()
        };
        found.into_iter().map(ParticipantGroup::from_snapshot).collect()
    }

    async fn update(&self, group: &ParticipantGroup) -> Result<(), DeploymentError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        let id = group.study_deployment_id();
        match snapshots.get_mut(&id) {
            Some(stored) => {
                *stored = group.snapshot();
                Ok(())
            }
            None => Err(DeploymentError::InvalidArgument(format!(
                "participant group of study deployment {} does not exist",
                id
            ))),
        }
    }

    async fn remove(&self, study_deployment_id: Uuid) -> Result<bool, DeploymentError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.remove(&study_deployment_id).is_some())
    }
}
