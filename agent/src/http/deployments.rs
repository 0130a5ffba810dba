//! Deployment service over HTTP
//!
//! Request bodies are shared with the host's handlers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployments::service::DeploymentService;
use crate::errors::DeploymentError;
use crate::http::client::HttpClient;
use crate::models::deployment::{ConfigurationToken, PrimaryDeviceDeployment};
use crate::models::device::DeviceRegistration;
use crate::models::protocol::StudyProtocolSnapshot;
use crate::models::status::StudyDeploymentStatus;
use crate::participants::accounts::ParticipantInvitation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStudyDeploymentRequest {
    pub id: Uuid,
    pub protocol: StudyProtocolSnapshot,
    pub invitations: Vec<ParticipantInvitation>,
    #[serde(default)]
    pub preregistrations: BTreeMap<String, DeviceRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyDeploymentIds {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSuccessfulRequest {
    pub configuration_token: ConfigurationToken,
}

/// [`DeploymentService`] of a remote deployment host
pub struct HttpDeploymentService {
    client: HttpClient,
}

impl HttpDeploymentService {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeploymentService for HttpDeploymentService {
    async fn create_study_deployment(
        &self,
        id: Uuid,
        protocol: StudyProtocolSnapshot,
        invitations: Vec<ParticipantInvitation>,
        preregistrations: BTreeMap<String, DeviceRegistration>,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let request = CreateStudyDeploymentRequest {
            id,
            protocol,
            invitations,
            preregistrations,
        };
        self.client.post(&["deployments"], &request).await
    }

    async fn remove_study_deployments(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, DeploymentError> {
        let request = StudyDeploymentIds { ids: ids.to_vec() };
        let removed: StudyDeploymentIds = self.client.post(&["deployments", "remove"], &request).await?;
        Ok(removed.ids)
    }

    async fn get_study_deployment_status(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.client.get(&["deployments", &id.to_string(), "status"]).await
    }

    async fn get_study_deployment_status_list(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<StudyDeploymentStatus>, DeploymentError> {
        let request = StudyDeploymentIds { ids: ids.to_vec() };
        self.client.post(&["deployments", "statuses"], &request).await
    }

    async fn register_device(
        &self,
        id: Uuid,
        role_name: &str,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.client
            .put(
                &["deployments", &id.to_string(), "devices", role_name, "registration"],
                &registration,
            )
            .await
    }

    async fn unregister_device(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.client
            .delete(&["deployments", &id.to_string(), "devices", role_name, "registration"])
            .await
    }

    async fn get_device_deployment_for(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<PrimaryDeviceDeployment, DeploymentError> {
        self.client
            .get(&["deployments", &id.to_string(), "devices", role_name, "deployment"])
            .await
    }

    async fn deployment_successful(
        &self,
        id: Uuid,
        role_name: &str,
        token: ConfigurationToken,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let request = DeploymentSuccessfulRequest {
            configuration_token: token,
        };
        self.client
            .post(
                &["deployments", &id.to_string(), "devices", role_name, "deployed"],
                &request,
            )
            .await
    }

    async fn stop(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.client
            .post(&["deployments", &id.to_string(), "stop"], &serde_json::json!({}))
            .await
    }
}
