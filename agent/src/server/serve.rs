//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeploymentError;
use crate::server::handlers::{
    active_invitations_handler, create_study_deployment_handler, deployment_successful_handler,
    device_deployment_handler, health_handler, participant_data_handler, register_device_handler,
    remove_study_deployments_handler, set_participant_data_handler, stop_handler,
    study_deployment_status_handler, study_deployment_status_list_handler, unregister_device_handler,
    version_handler,
};
use crate::server::state::ServerState;

/// Routes of the deployment host, nested under `/api/v1`
pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        // Study deployments
        .route("/deployments", post(create_study_deployment_handler))
        .route("/deployments/remove", post(remove_study_deployments_handler))
        .route("/deployments/statuses", post(study_deployment_status_list_handler))
        .route("/deployments/{id}/status", get(study_deployment_status_handler))
        .route("/deployments/{id}/stop", post(stop_handler))
        // Devices
        .route(
            "/deployments/{id}/devices/{role}/registration",
            put(register_device_handler).delete(unregister_device_handler),
        )
        .route(
            "/deployments/{id}/devices/{role}/deployment",
            get(device_deployment_handler),
        )
        .route(
            "/deployments/{id}/devices/{role}/deployed",
            post(deployment_successful_handler),
        )
        // Participants
        .route(
            "/deployments/{id}/participant-data",
            get(participant_data_handler).put(set_participant_data_handler),
        )
        .route("/accounts/{id}/invitations", get(active_invitations_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeploymentError>>, DeploymentError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting deployment host on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeploymentError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeploymentError::ServerError(e.to_string()))
    });

    Ok(handle)
}
