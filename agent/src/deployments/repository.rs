//! Storage of study deployments

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::deployments::study_deployment::{StudyDeployment, StudyDeploymentSnapshot};
use crate::errors::DeploymentError;

/// Where the deployment host keeps its study deployments
#[async_trait]
pub trait StudyDeploymentRepository: Send + Sync {
    /// Add a new deployment; fails when the ID is taken
    async fn add(&self, deployment: &StudyDeployment) -> Result<(), DeploymentError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<StudyDeployment>, DeploymentError>;

    /// Deployments with the given IDs; unknown IDs are skipped
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<StudyDeployment>, DeploymentError>;

    /// Replace a stored deployment; fails when it is not stored
    async fn update(&self, deployment: &StudyDeployment) -> Result<(), DeploymentError>;

    /// Remove deployments, returning the IDs which were actually removed
    async fn remove(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, DeploymentError>;
}

/// Repository keeping deployment snapshots in memory
#[derive(Default)]
pub struct InMemoryStudyDeploymentRepository {
    snapshots: RwLock<HashMap<Uuid, StudyDeploymentSnapshot>>,
}

impl InMemoryStudyDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StudyDeploymentRepository for InMemoryStudyDeploymentRepository {
    async fn add(&self, deployment: &StudyDeployment) -> Result<(), DeploymentError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        if snapshots.contains_key(&deployment.id()) {
            return Err(DeploymentError::InvalidArgument(format!(
                "study deployment {} already exists",
                deployment.id()
            )));
        }
        snapshots.insert(deployment.id(), deployment.snapshot());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<StudyDeployment>, DeploymentError> {
        let snapshot = {
            let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
            snapshots.get(&id).cloned()
        };
        snapshot.map(StudyDeployment::from_snapshot).transpose()
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<StudyDeployment>, DeploymentError> {
        let found: Vec<StudyDeploymentSnapshot> = {
            let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
            ids.iter().filter_map(|id| snapshots.get(id).cloned()).collect()
        };
        found.into_iter().map(StudyDeployment::from_snapshot).collect()
    }

    async fn update(&self, deployment: &StudyDeployment) -> Result<(), DeploymentError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        match snapshots.get_mut(&deployment.id()) {
            Some(stored) => {
                *stored = deployment.snapshot();
                Ok(())
            }
            None => Err(DeploymentError::InvalidArgument(format!(
                "study deployment {} does not exist",
                deployment.id()
            ))),
        }
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, DeploymentError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        Ok(ids
            .iter()
            .filter(|id| snapshots.remove(*id).is_some())
            .copied()
            .collect())
    }
}
