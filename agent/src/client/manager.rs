//! Client manager
//!
//! Container of the studies this device participates in. Each study is driven
//! towards deployment by [`ClientManager::try_deployment`], which talks to the
//! deployment service and records progress in the client repository.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::capability::DeviceDataCollector;
use crate::client::repository::{ClientRepository, ClientSnapshot, InMemoryClientRepository};
use crate::client::study::{ClientStudy, StudyEvent, StudyKey, StudyStatus};
use crate::deployments::service::DeploymentService;
use crate::errors::DeploymentError;
use crate::models::deployment::PrimaryDeviceDeployment;
use crate::models::device::DeviceRegistration;
use crate::models::status::{DeviceDeploymentStatus, StudyDeploymentStatus};

pub struct ClientManager {
    service: Arc<dyn DeploymentService>,
    repository: Arc<dyn ClientRepository>,
    collector: Arc<dyn DeviceDataCollector>,
    locks: RwLock<HashMap<StudyKey, Arc<Mutex<()>>>>,
}

impl ClientManager {
    pub fn new(
        service: Arc<dyn DeploymentService>,
        repository: Arc<dyn ClientRepository>,
        collector: Arc<dyn DeviceDataCollector>,
    ) -> Self {
        Self {
            service,
            repository,
            collector,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Restore a manager from a snapshot, keeping its state in memory
    pub async fn from_snapshot(
        snapshot: ClientSnapshot,
        service: Arc<dyn DeploymentService>,
        collector: Arc<dyn DeviceDataCollector>,
    ) -> Result<Self, DeploymentError> {
        let repository = InMemoryClientRepository::new();
        if let Some(registration) = snapshot.device_registration {
            repository.set_device_registration(registration).await?;
        }
        for study in snapshot.studies {
            repository.add_study(&ClientStudy::from_snapshot(study)?).await?;
        }
        Ok(Self::new(service, Arc::new(repository), collector))
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, DeploymentError> {
        Ok(ClientSnapshot {
            device_registration: self.repository.get_device_registration().await?,
            studies: self
                .repository
                .get_study_list()
                .await?
                .iter()
                .map(ClientStudy::snapshot)
                .collect(),
        })
    }

    /// Set the registration used for subsequent registrations
    pub async fn configure(&self, registration: DeviceRegistration) -> Result<(), DeploymentError> {
        info!("Configured device registration '{}'", registration.device_id);
        self.repository.set_device_registration(registration).await
    }

    pub async fn device_registration(&self) -> Result<DeviceRegistration, DeploymentError> {
        self.repository
            .get_device_registration()
            .await?
            .ok_or_else(|| DeploymentError::InvalidState("device is not configured".to_string()))
    }

    /// Start participating in a study by registering this device for `role_name`
    pub async fn add_study(
        &self,
        study_deployment_id: Uuid,
        role_name: &str,
    ) -> Result<StudyStatus, DeploymentError> {
        let key = StudyKey::new(study_deployment_id, role_name);
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;

        if self.repository.get_study(&key).await?.is_some() {
            return Err(DeploymentError::InvalidArgument(format!(
                "study {} was already added",
                key
            )));
        }

        let registration = self.device_registration().await?;
        let status = self
            .service
            .register_device(study_deployment_id, role_name, registration.clone())
            .await?;

        let mut study = ClientStudy::new(key);
        study.process(StudyEvent::Registered(registration))?;
        study.process(StudyEvent::StatusReceived(status))?;
        self.repository.add_study(&study).await?;

        let status = study.status();
        info!("Added study {} ({})", study.key(), status.name());
        Ok(status)
    }

    /// Move a study as far towards running as the other devices allow
    pub async fn try_deployment(&self, key: &StudyKey) -> Result<StudyStatus, DeploymentError> {
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        let mut study = self.study(key).await?;
        if study.status() == StudyStatus::Stopped {
            return Ok(StudyStatus::Stopped);
        }

        let status = self.register(&mut study).await?;
        study.process(StudyEvent::StatusReceived(status.clone()))?;

        if status.is_stopped() || study.is_deployed() {
            return self.store(&study).await;
        }

        let can_obtain = study
            .device_status()
            .is_some_and(DeviceDeploymentStatus::can_obtain_device_deployment);
        if !can_obtain {
            return self.store(&study).await;
        }

        let deployment = self
            .service
            .get_device_deployment_for(key.study_deployment_id, &key.device_role_name)
            .await?;
        study.process(StudyEvent::DeploymentReceived(deployment.clone()))?;

        let remaining = study
            .device_status()
            .map(DeviceDeploymentStatus::remaining_devices_to_register_before_deployment)
            .unwrap_or_default();
        if !remaining.is_empty() {
            debug!("Study {} waits for {:?} before deploying", key, remaining);
            return self.store(&study).await;
        }

        self.validate_capabilities(&deployment)?;

        let result = self
            .service
            .deployment_successful(key.study_deployment_id, &key.device_role_name, deployment.last_update)
            .await;
        match result {
            Ok(status) => {
                study.process(StudyEvent::Deployed(status))?;
                info!("Deployed study {} with configuration {}", key, deployment.last_update);
            }
            Err(err @ (DeploymentError::InvalidArgument(_) | DeploymentError::InvalidState(_))) => {
                warn!("Deployment of study {} not accepted: {}", key, err);
            }
            Err(err) => return Err(err),
        }

        self.store(&study).await
    }

    pub async fn contains_study(&self, key: &StudyKey) -> Result<bool, DeploymentError> {
        Ok(self.repository.get_study(key).await?.is_some())
    }

    pub async fn get_study_status(&self, key: &StudyKey) -> Result<StudyStatus, DeploymentError> {
        Ok(self.study(key).await?.status())
    }

    pub async fn get_study_status_list(&self) -> Result<Vec<(StudyKey, StudyStatus)>, DeploymentError> {
        Ok(self
            .repository
            .get_study_list()
            .await?
            .into_iter()
            .map(|study| {
                let status = study.status();
                (study.key().clone(), status)
            })
            .collect())
    }

    /// Stop the study deployment; nothing happens when it is stopped already
    pub async fn stop_study(&self, key: &StudyKey) -> Result<StudyStatus, DeploymentError> {
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        let mut study = self.study(key).await?;
        if study.status() == StudyStatus::Stopped {
            return Ok(StudyStatus::Stopped);
        }

        let status = self.service.stop(key.study_deployment_id).await?;
        study.process(StudyEvent::StatusReceived(status))?;
        info!("Stopped study {}", key);
        self.store(&study).await
    }

    /// Stop tracking a study on this device; returns whether it was tracked
    pub async fn remove_study(&self, key: &StudyKey) -> Result<bool, DeploymentError> {
        let removed = {
            let lock = self.lock_for(key).await;
            let _guard = lock.lock().await;
            self.repository.remove_study(key).await?
        };
        self.locks.write().await.remove(key);
        if removed {
            info!("Removed study {}", key);
        }
        Ok(removed)
    }

    async fn lock_for(&self, key: &StudyKey) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.locks.write().await;
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn study(&self, key: &StudyKey) -> Result<ClientStudy, DeploymentError> {
        self.repository
            .get_study(key)
            .await?
            .ok_or_else(|| DeploymentError::InvalidArgument(format!("study {} does not exist", key)))
    }

    async fn store(&self, study: &ClientStudy) -> Result<StudyStatus, DeploymentError> {
        self.repository.update_study(study).await?;
        Ok(study.status())
    }

    /// Make sure the host knows this device by its current registration,
    /// returning the latest deployment status
    async fn register(&self, study: &mut ClientStudy) -> Result<StudyDeploymentStatus, DeploymentError> {
        let key = study.key().clone();
        let registration = self.device_registration().await?;

        if study.registration() != Some(&registration) {
            if study.registration().is_some() {
                info!("Registration of study {} changed; registering again", key);
                self.unregister(study).await?;
            }
            let status = self
                .service
                .register_device(key.study_deployment_id, &key.device_role_name, registration.clone())
                .await?;
            study.process(StudyEvent::Registered(registration))?;
            return Ok(status);
        }

        let status = self
            .service
            .get_study_deployment_status(key.study_deployment_id)
            .await?;
        let unregistered = matches!(
            status.device_status(&key.device_role_name),
            Some(DeviceDeploymentStatus::Unregistered { .. })
        );
        if unregistered && !status.is_stopped() {
            debug!("Device of study {} was unregistered by the host", key);
            return self
                .service
                .register_device(key.study_deployment_id, &key.device_role_name, registration)
                .await;
        }
        Ok(status)
    }

    /// Drop the registration the host knows this device by. The study is
    /// stored right away so a failing registration afterwards is retried
    /// from scratch.
    async fn unregister(&self, study: &mut ClientStudy) -> Result<(), DeploymentError> {
        let key = study.key().clone();
        match self
            .service
            .unregister_device(key.study_deployment_id, &key.device_role_name)
            .await
        {
            Ok(_) => {}
            Err(DeploymentError::InvalidArgument(reason)) => {
                // The host may have unregistered it already
                let status = self
                    .service
                    .get_study_deployment_status(key.study_deployment_id)
                    .await?;
                let registered = status
                    .device_status(&key.device_role_name)
                    .is_some_and(|device| device.is_registered());
                if registered {
                    return Err(DeploymentError::InvalidArgument(reason));
                }
                debug!("Device of study {} was not registered anymore", key);
            }
            Err(e) => return Err(e),
        }

        study.process(StudyEvent::Unregistered)?;
        self.repository.update_study(study).await
    }

    /// Check this device can connect to every connected device and collect
    /// every measured data type
    fn validate_capabilities(&self, deployment: &PrimaryDeviceDeployment) -> Result<(), DeploymentError> {
        for device in &deployment.connected_devices {
            let Some(registration) = deployment.connected_device_registrations.get(&device.role_name) else {
                // Only optional devices can be missing once the deployment is ready
                debug!(
                    "Skipping unregistered optional device '{}' connected to '{}'",
                    device.role_name,
                    deployment.role_name()
                );
                continue;
            };
            if !self.collector.supports_connected_device(&device.kind, registration) {
                return Err(DeploymentError::UnsupportedCapability {
                    device_role: device.role_name.clone(),
                    requirement: format!("connecting to a {} device", device.kind.type_name()),
                });
            }
        }

        for (role_name, data_types) in deployment.required_data_types() {
            let connected = if role_name == deployment.role_name() {
                None
            } else {
                Some(deployment.connected_device(&role_name).ok_or_else(|| {
                    DeploymentError::Inconsistent(format!(
                        "deployment of '{}' measures on unknown device '{}'",
                        deployment.role_name(),
                        role_name
                    ))
                })?)
            };

            for data_type in &data_types {
                let supported = match connected {
                    None => self.collector.supports_data_type(data_type),
                    Some(device) => self.collector.supports_connected_data_type(&device.kind, data_type),
                };
                if !supported {
                    return Err(DeploymentError::UnsupportedCapability {
                        device_role: role_name.clone(),
                        requirement: format!("collecting {}", data_type),
                    });
                }
            }
        }
        Ok(())
    }
}
