//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::errors::DeploymentError;
use crate::http::client::ErrorResponse;
use crate::http::deployments::{
    CreateStudyDeploymentRequest, DeploymentSuccessfulRequest, StudyDeploymentIds,
};
use crate::models::deployment::PrimaryDeviceDeployment;
use crate::models::device::DeviceRegistration;
use crate::models::status::StudyDeploymentStatus;
use crate::participants::accounts::ActiveParticipationInvitation;
use crate::participants::group::{ParticipantDataEntry, ParticipantDataInput};
use crate::server::state::ServerState;
use crate::utils::{version_info, VersionInfo};

type ApiResult<T> = Result<Json<T>, DeploymentError>;

impl DeploymentError {
    fn status_code(&self) -> StatusCode {
        match self {
            DeploymentError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DeploymentError::InvalidState(_) => StatusCode::CONFLICT,
            DeploymentError::Stopped(_) => StatusCode::GONE,
            DeploymentError::UnsupportedCapability { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DeploymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.kind().to_string(),
                message: self.detail(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "study-agent".to_string(),
        version: version_info().version,
    })
}

pub async fn version_handler() -> Json<VersionInfo> {
    Json(version_info())
}

pub async fn create_study_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateStudyDeploymentRequest>,
) -> ApiResult<StudyDeploymentStatus> {
    let status = state
        .deployments
        .create_study_deployment(
            request.id,
            request.protocol,
            request.invitations,
            request.preregistrations,
        )
        .await?;
    Ok(Json(status))
}

pub async fn remove_study_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StudyDeploymentIds>,
) -> ApiResult<StudyDeploymentIds> {
    let ids = state.deployments.remove_study_deployments(&request.ids).await?;
    Ok(Json(StudyDeploymentIds { ids }))
}

pub async fn study_deployment_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StudyDeploymentStatus> {
    Ok(Json(state.deployments.get_study_deployment_status(id).await?))
}

pub async fn study_deployment_status_list_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StudyDeploymentIds>,
) -> ApiResult<Vec<StudyDeploymentStatus>> {
    Ok(Json(
        state
            .deployments
            .get_study_deployment_status_list(&request.ids)
            .await?,
    ))
}

pub async fn register_device_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, role_name)): Path<(Uuid, String)>,
    Json(registration): Json<DeviceRegistration>,
) -> ApiResult<StudyDeploymentStatus> {
    Ok(Json(
        state
            .deployments
            .register_device(id, &role_name, registration)
            .await?,
    ))
}

pub async fn unregister_device_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, role_name)): Path<(Uuid, String)>,
) -> ApiResult<StudyDeploymentStatus> {
    Ok(Json(state.deployments.unregister_device(id, &role_name).await?))
}

pub async fn device_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, role_name)): Path<(Uuid, String)>,
) -> ApiResult<PrimaryDeviceDeployment> {
    Ok(Json(
        state
            .deployments
            .get_device_deployment_for(id, &role_name)
            .await?,
    ))
}

pub async fn deployment_successful_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, role_name)): Path<(Uuid, String)>,
    Json(request): Json<DeploymentSuccessfulRequest>,
) -> ApiResult<StudyDeploymentStatus> {
    Ok(Json(
        state
            .deployments
            .deployment_successful(id, &role_name, request.configuration_token)
            .await?,
    ))
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StudyDeploymentStatus> {
    Ok(Json(state.deployments.stop(id).await?))
}

pub async fn participant_data_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<ParticipantDataEntry>> {
    Ok(Json(state.participation.get_participant_data(id).await?))
}

pub async fn set_participant_data_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(inputs): Json<Vec<ParticipantDataInput>>,
) -> ApiResult<Vec<ParticipantDataEntry>> {
    Ok(Json(state.participation.set_participant_data(id, inputs).await?))
}

pub async fn active_invitations_handler(
    State(state): State<Arc<ServerState>>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Vec<ActiveParticipationInvitation>> {
    Ok(Json(
        state
            .participation
            .get_active_participation_invitations(account_id)
            .await?,
    ))
}
