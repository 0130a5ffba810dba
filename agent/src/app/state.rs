//! Application state management

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::app::options::AppOptions;
use crate::client::manager::ClientManager;
use crate::client::repository::{ClientRepository, FileClientRepository};
use crate::deployments::events::EventBus;
use crate::deployments::repository::InMemoryStudyDeploymentRepository;
use crate::deployments::service::DeploymentServiceHost;
use crate::errors::DeploymentError;
use crate::http::client::HttpClient;
use crate::http::deployments::HttpDeploymentService;
use crate::models::device::DeviceRegistration;
use crate::participants::accounts::InMemoryAccountService;
use crate::participants::repository::InMemoryParticipantGroupRepository;
use crate::participants::service::ParticipationService;

/// State of the deployment host
pub struct HostState {
    pub deployments: Arc<DeploymentServiceHost>,
    pub participation: Arc<ParticipationService>,
    pub accounts: Arc<InMemoryAccountService>,
}

impl HostState {
    pub fn init(options: &AppOptions) -> Self {
        info!(
            "Initializing deployment host (redeployment policy: {:?})...",
            options.host.redeployment_policy
        );

        let accounts = Arc::new(InMemoryAccountService::new());
        let participation = Arc::new(ParticipationService::new(
            Arc::new(InMemoryParticipantGroupRepository::new()),
            accounts.clone(),
        ));
        let deployments = Arc::new(
            DeploymentServiceHost::new(
                Arc::new(InMemoryStudyDeploymentRepository::new()),
                EventBus::new(options.host.event_capacity),
                options.host.redeployment_policy,
            )
            .with_handler(participation.clone()),
        );

        Self {
            deployments,
            participation,
            accounts,
        }
    }

    pub async fn shutdown(&self) -> Result<(), DeploymentError> {
        info!("Shutting down deployment host state...");
        Ok(())
    }
}

/// State of a device taking part in studies
pub struct DeviceState {
    pub manager: Arc<ClientManager>,
}

impl DeviceState {
    pub async fn init(options: &AppOptions) -> Result<Self, DeploymentError> {
        info!("Initializing device state...");

        options.layout.setup().await?;

        let client = HttpClient::new(&options.backend.base_url, options.backend.api_token.clone())?;
        let service = Arc::new(HttpDeploymentService::new(client));
        let repository = Arc::new(FileClientRepository::new(options.layout.client_file()));
        let registration = resolve_registration(options, repository.as_ref()).await?;

        let manager = Arc::new(ClientManager::new(
            service,
            repository,
            Arc::new(options.device.capabilities.clone()),
        ));
        manager.configure(registration).await?;

        Ok(Self { manager })
    }

    pub async fn shutdown(&self) -> Result<(), DeploymentError> {
        info!("Shutting down device state...");
        let studies = self.manager.get_study_status_list().await?;
        for (key, status) in studies {
            info!("Study {} left {}", key, status.name());
        }
        Ok(())
    }
}

/// Registration from the options, else the stored one, else a new one
async fn resolve_registration(
    options: &AppOptions,
    repository: &dyn ClientRepository,
) -> Result<DeviceRegistration, DeploymentError> {
    if let Some(registration) = &options.device.registration {
        return Ok(registration.clone());
    }
    if let Some(registration) = repository.get_device_registration().await? {
        return Ok(registration);
    }

    let registration = DeviceRegistration::new(Uuid::new_v4().to_string());
    info!("Generated device registration '{}'", registration.device_id);
    Ok(registration)
}
