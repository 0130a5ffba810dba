//! Deployment service
//!
//! [`DeploymentService`] is what devices talk to. [`DeploymentServiceHost`]
//! implements it on top of a [`StudyDeploymentRepository`], serialising all
//! mutations of one deployment behind a per-deployment lock. Once a mutation
//! is stored, the events it raised go to the registered handlers, still under
//! the lock, and are then broadcast.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::deployments::events::{DeploymentEvent, DeploymentEventHandler, EventBus};
use crate::deployments::readiness::RedeploymentPolicy;
use crate::deployments::repository::StudyDeploymentRepository;
use crate::deployments::study_deployment::StudyDeployment;
use crate::errors::DeploymentError;
use crate::models::deployment::{ConfigurationToken, PrimaryDeviceDeployment};
use crate::models::device::DeviceRegistration;
use crate::models::protocol::StudyProtocolSnapshot;
use crate::models::status::StudyDeploymentStatus;
use crate::participants::accounts::ParticipantInvitation;

/// Operations on study deployments
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Deploy `protocol` for the invited participants, optionally registering
    /// connected devices right away
    async fn create_study_deployment(
        &self,
        id: Uuid,
        protocol: StudyProtocolSnapshot,
        invitations: Vec<ParticipantInvitation>,
        preregistrations: BTreeMap<String, DeviceRegistration>,
    ) -> Result<StudyDeploymentStatus, DeploymentError>;

    /// Remove deployments; returns the IDs which existed
    async fn remove_study_deployments(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, DeploymentError>;

    async fn get_study_deployment_status(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError>;

    async fn get_study_deployment_status_list(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<StudyDeploymentStatus>, DeploymentError>;

    async fn register_device(
        &self,
        id: Uuid,
        role_name: &str,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentError>;

    async fn unregister_device(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<StudyDeploymentStatus, DeploymentError>;

    async fn get_device_deployment_for(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<PrimaryDeviceDeployment, DeploymentError>;

    /// Confirm that `role_name` deployed the configuration identified by `token`
    async fn deployment_successful(
        &self,
        id: Uuid,
        role_name: &str,
        token: ConfigurationToken,
    ) -> Result<StudyDeploymentStatus, DeploymentError>;

    async fn stop(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError>;
}

/// Authoritative, in-process deployment service
pub struct DeploymentServiceHost {
    repository: Arc<dyn StudyDeploymentRepository>,
    events: EventBus,
    handlers: Vec<Arc<dyn DeploymentEventHandler>>,
    policy: RedeploymentPolicy,
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DeploymentServiceHost {
    pub fn new(
        repository: Arc<dyn StudyDeploymentRepository>,
        events: EventBus,
        policy: RedeploymentPolicy,
    ) -> Self {
        Self {
            repository,
            events,
            handlers: Vec::new(),
            policy,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Deliver every raised event to `handler` before it is broadcast
    pub fn with_handler(mut self, handler: Arc<dyn DeploymentEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&id) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.locks.write().await;
        // Another task may have created it in between
        Arc::clone(locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    async fn load(&self, id: Uuid) -> Result<StudyDeployment, DeploymentError> {
        self.repository.get_by_id(id).await?.ok_or_else(|| {
            DeploymentError::InvalidArgument(format!("study deployment {} does not exist", id))
        })
    }

    /// Hand committed events to the handlers, then broadcast them
    async fn dispatch(&self, events: Vec<DeploymentEvent>) {
        for event in &events {
            for handler in &self.handlers {
                if let Err(e) = handler.handle_deployment_event(event).await {
                    error!(
                        "Failed to handle {} event of {}: {}",
                        event.name(),
                        event.study_deployment_id(),
                        e
                    );
                }
            }
        }
        self.events.publish(events);
    }

    /// Apply `change` to deployment `id` while holding its lock, store the
    /// result and publish the raised events
    async fn mutate<T, F>(&self, id: Uuid, change: F) -> Result<(T, StudyDeploymentStatus), DeploymentError>
    where
        T: Send,
        F: FnOnce(&mut StudyDeployment) -> Result<T, DeploymentError> + Send,
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut deployment = self.load(id).await?;
        let value = change(&mut deployment)?;
        self.repository.update(&deployment).await?;

        self.dispatch(deployment.consume_events()).await;
        Ok((value, deployment.status()))
    }
}

#[async_trait]
impl DeploymentService for DeploymentServiceHost {
    async fn create_study_deployment(
        &self,
        id: Uuid,
        protocol: StudyProtocolSnapshot,
        invitations: Vec<ParticipantInvitation>,
        preregistrations: BTreeMap<String, DeviceRegistration>,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut deployment = StudyDeployment::new(id, protocol, &invitations, self.policy)?;
        for (role_name, registration) in preregistrations {
            deployment.preregister(&role_name, registration)?;
        }
        self.repository.add(&deployment).await?;

        self.dispatch(deployment.consume_events()).await;
        Ok(deployment.status())
    }

    async fn remove_study_deployments(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, DeploymentError> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.lock_for(*id).await;
            let _guard = lock.lock().await;
            for id in self.repository.remove(&[*id]).await? {
                self.dispatch(vec![DeploymentEvent::Removed {
                    study_deployment_id: id,
                }])
                .await;
                removed.push(id);
            }
        }

        {
            let mut locks = self.locks.write().await;
            for id in &removed {
                locks.remove(id);
            }
        }

        info!("Removed {} study deployment(s)", removed.len());
        Ok(removed)
    }

    async fn get_study_deployment_status(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError> {
        Ok(self.load(id).await?.status())
    }

    async fn get_study_deployment_status_list(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<StudyDeploymentStatus>, DeploymentError> {
        let deployments = self.repository.get_by_ids(ids).await?;
        if let Some(missing) = ids.iter().find(|id| !deployments.iter().any(|d| d.id() == **id)) {
            return Err(DeploymentError::InvalidArgument(format!(
                "study deployment {} does not exist",
                missing
            )));
        }
        Ok(deployments.iter().map(StudyDeployment::status).collect())
    }

    async fn register_device(
        &self,
        id: Uuid,
        role_name: &str,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let (changed, status) = self
            .mutate(id, |deployment| deployment.register_device(role_name, registration))
            .await?;
        if !changed {
            debug!("Registration of '{}' in {} unchanged", role_name, id);
        }
        Ok(status)
    }

    async fn unregister_device(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let ((), status) = self
            .mutate(id, |deployment| deployment.unregister_device(role_name))
            .await?;
        Ok(status)
    }

    async fn get_device_deployment_for(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<PrimaryDeviceDeployment, DeploymentError> {
        self.load(id).await?.get_device_deployment_for(role_name)
    }

    async fn deployment_successful(
        &self,
        id: Uuid,
        role_name: &str,
        token: ConfigurationToken,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let result = self
            .mutate(id, |deployment| deployment.device_deployed(role_name, token))
            .await;
        match result {
            Ok(((), status)) => Ok(status),
            Err(err) => {
                warn!(
                    "Deployment of '{}' in {} with configuration {} rejected: {}",
                    role_name, id, token, err
                );
                Err(err)
            }
        }
    }

    async fn stop(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError> {
        let (_, status) = self.mutate(id, |deployment| Ok(deployment.stop())).await?;
        Ok(status)
    }
}
