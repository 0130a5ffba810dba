use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use study_agent::client::capability::StaticDataCollector;
use study_agent::client::manager::ClientManager;
use study_agent::client::repository::InMemoryClientRepository;
use study_agent::client::study::{StudyKey, StudyStatus};
use study_agent::deployments::service::{DeploymentService, DeploymentServiceHost};
use study_agent::errors::DeploymentError;
use study_agent::models::deployment::{ConfigurationToken, PrimaryDeviceDeployment};
use study_agent::models::device::{DeviceKind, DeviceRegistration};
use study_agent::models::protocol::StudyProtocolSnapshot;
use study_agent::models::status::StudyDeploymentStatus;
use study_agent::participants::accounts::ParticipantInvitation;
use study_agent::workers::poller;
use uuid::Uuid;

use crate::common::{
    client, create, full_capabilities, host, phone_registration, smartphone_depending_on_wearable,
    smartphone_only, smartphone_with_connected_wearable, smartphone_with_optional_wearable, strap_registration,
    CountingCollector,
};

/// Deployment host on which other devices act in between the client's calls
struct InterferingHost {
    inner: Arc<DeploymentServiceHost>,

    /// Registered right before the next deployment confirmation
    register_before_confirming: Mutex<Option<(String, DeviceRegistration)>>,

    /// Hand out the deployment of this role instead of the requested one
    deployment_of: Option<String>,
}

impl InterferingHost {
    fn new(inner: Arc<DeploymentServiceHost>) -> Self {
        Self {
            inner,
            register_before_confirming: Mutex::new(None),
            deployment_of: None,
        }
    }

    fn registering_before_confirming(self, role_name: &str, registration: DeviceRegistration) -> Self {
        *self.register_before_confirming.lock().unwrap() = Some((role_name.to_string(), registration));
        self
    }

    fn handing_out_deployment_of(mut self, role_name: &str) -> Self {
        self.deployment_of = Some(role_name.to_string());
        self
    }
}

#[async_trait]
impl DeploymentService for InterferingHost {
    async fn create_study_deployment(
        &self,
        id: Uuid,
        protocol: StudyProtocolSnapshot,
        invitations: Vec<ParticipantInvitation>,
        preregistrations: BTreeMap<String, DeviceRegistration>,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.inner
            .create_study_deployment(id, protocol, invitations, preregistrations)
            .await
    }

    async fn remove_study_deployments(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, DeploymentError> {
        self.inner.remove_study_deployments(ids).await
    }

    async fn get_study_deployment_status(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.inner.get_study_deployment_status(id).await
    }

    async fn get_study_deployment_status_list(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<StudyDeploymentStatus>, DeploymentError> {
        self.inner.get_study_deployment_status_list(ids).await
    }

    async fn register_device(
        &self,
        id: Uuid,
        role_name: &str,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.inner.register_device(id, role_name, registration).await
    }

    async fn unregister_device(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.inner.unregister_device(id, role_name).await
    }

    async fn get_device_deployment_for(
        &self,
        id: Uuid,
        role_name: &str,
    ) -> Result<PrimaryDeviceDeployment, DeploymentError> {
        let role_name = self.deployment_of.as_deref().unwrap_or(role_name);
        self.inner.get_device_deployment_for(id, role_name).await
    }

    async fn deployment_successful(
        &self,
        id: Uuid,
        role_name: &str,
        token: ConfigurationToken,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        let pending = self.register_before_confirming.lock().unwrap().take();
        if let Some((other_role, registration)) = pending {
            self.inner.register_device(id, &other_role, registration).await?;
        }
        self.inner.deployment_successful(id, role_name, token).await
    }

    async fn stop(&self, id: Uuid) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.inner.stop(id).await
    }
}

#[tokio::test]
async fn test_smartphone_only_study_runs() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let collector = Arc::new(CountingCollector::new(full_capabilities()));
    let manager = client(host.clone(), collector.clone(), phone_registration()).await;

    let status = manager.add_study(id, "smartphone").await.unwrap();
    assert_eq!(status, StudyStatus::AwaitingDeviceDeployment);

    let key = StudyKey::new(id, "smartphone");
    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Running);
    assert!(host.get_study_deployment_status(id).await.unwrap().is_running());
    let checks = collector.checks();
    assert!(checks > 0);

    // Nothing left to validate once deployed
    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Running);
    assert_eq!(collector.checks(), checks);
}

#[tokio::test]
async fn test_study_waits_for_connected_device() {
    let host = host();
    let id = create(host.as_ref(), smartphone_with_connected_wearable()).await;
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");

    let status = manager.add_study(id, "smartphone").await.unwrap();
    let StudyStatus::AwaitingOtherDeviceRegistrations { remaining_devices } = status else {
        panic!("unexpected status {:?}", status);
    };
    assert!(remaining_devices.contains("wearable"));

    // Still waiting, retrying changes nothing
    assert!(matches!(
        manager.try_deployment(&key).await.unwrap(),
        StudyStatus::AwaitingOtherDeviceRegistrations { .. }
    ));

    host.register_device(id, "wearable", strap_registration()).await.unwrap();
    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Running);
}

#[tokio::test]
async fn test_study_waits_for_other_primary_device() {
    let host = host();
    let id = create(host.as_ref(), smartphone_depending_on_wearable()).await;
    let capabilities = Arc::new(full_capabilities());
    let phone = client(host.clone(), capabilities.clone(), phone_registration()).await;
    let watch = client(host.clone(), capabilities, DeviceRegistration::new("watch-1")).await;
    let phone_key = StudyKey::new(id, "smartphone");
    let watch_key = StudyKey::new(id, "wearable");

    assert!(matches!(
        phone.add_study(id, "smartphone").await.unwrap(),
        StudyStatus::AwaitingOtherDeviceRegistrations { .. }
    ));

    watch.add_study(id, "wearable").await.unwrap();
    assert_eq!(
        phone.try_deployment(&phone_key).await.unwrap(),
        StudyStatus::AwaitingOtherDeviceDeployments
    );

    assert_eq!(watch.try_deployment(&watch_key).await.unwrap(), StudyStatus::Running);
    assert_eq!(phone.try_deployment(&phone_key).await.unwrap(), StudyStatus::Running);
}

#[tokio::test]
async fn test_missing_capability_blocks_deployment() {
    let host = host();
    let id = create(host.as_ref(), smartphone_with_connected_wearable()).await;
    host.register_device(id, "wearable", strap_registration()).await.unwrap();

    // Can connect to the strap but cannot collect heart rate from it
    let capabilities = StaticDataCollector::new()
        .with_local(["geolocation"])
        .with_connected(&DeviceKind::BleHeartRate, Vec::<String>::new());
    let manager = client(host.clone(), Arc::new(capabilities), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();

    let result = manager.try_deployment(&key).await;
    let Err(DeploymentError::UnsupportedCapability { device_role, .. }) = result else {
        panic!("unexpected result {:?}", result);
    };
    assert_eq!(device_role, "wearable");
    assert!(!host.get_study_deployment_status(id).await.unwrap().is_running());
    assert_eq!(
        manager.get_study_status(&key).await.unwrap(),
        StudyStatus::AwaitingDeviceDeployment
    );
}

#[tokio::test]
async fn test_reconfigured_device_registers_again() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();
    manager.try_deployment(&key).await.unwrap();

    manager.configure(DeviceRegistration::new("phone-2")).await.unwrap();
    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Running);

    let deployment = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    assert_eq!(deployment.registration.device_id, "phone-2");
    assert!(host.get_study_deployment_status(id).await.unwrap().is_running());
}

#[tokio::test]
async fn test_duplicate_study_is_rejected() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;

    manager.add_study(id, "smartphone").await.unwrap();
    assert!(matches!(
        manager.add_study(id, "smartphone").await,
        Err(DeploymentError::InvalidArgument(_))
    ));
    assert_eq!(manager.get_study_status_list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unconfigured_device_cannot_add_studies() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let manager = ClientManager::new(
        host.clone(),
        Arc::new(InMemoryClientRepository::new()),
        Arc::new(full_capabilities()),
    );

    assert!(matches!(
        manager.add_study(id, "smartphone").await,
        Err(DeploymentError::InvalidState(_))
    ));
    assert!(!manager.contains_study(&StudyKey::new(id, "smartphone")).await.unwrap());
}

#[tokio::test]
async fn test_stop_study() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();

    assert_eq!(manager.stop_study(&key).await.unwrap(), StudyStatus::Stopped);
    assert!(host.get_study_deployment_status(id).await.unwrap().is_stopped());
    // Stopped studies stay until removed
    assert_eq!(manager.stop_study(&key).await.unwrap(), StudyStatus::Stopped);
    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Stopped);
    assert!(manager.contains_study(&key).await.unwrap());

    assert!(manager.remove_study(&key).await.unwrap());
    assert!(!manager.remove_study(&key).await.unwrap());
}

#[tokio::test]
async fn test_unknown_study_is_rejected() {
    let host = host();
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(Uuid::new_v4(), "smartphone");

    assert!(matches!(
        manager.stop_study(&key).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.try_deployment(&key).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let host = host();
    let first = create(host.as_ref(), smartphone_only()).await;
    let second = create(host.as_ref(), smartphone_with_connected_wearable()).await;
    let capabilities = Arc::new(full_capabilities());
    let manager = client(host.clone(), capabilities.clone(), phone_registration()).await;
    manager.add_study(first, "smartphone").await.unwrap();
    manager.try_deployment(&StudyKey::new(first, "smartphone")).await.unwrap();
    manager.add_study(second, "smartphone").await.unwrap();

    let snapshot = manager.snapshot().await.unwrap();
    let json = serde_json::to_string(&snapshot).unwrap();
    let restored = ClientManager::from_snapshot(serde_json::from_str(&json).unwrap(), host.clone(), capabilities)
        .await
        .unwrap();

    assert_eq!(
        restored.device_registration().await.unwrap(),
        manager.device_registration().await.unwrap()
    );
    assert_eq!(
        restored.get_study_status_list().await.unwrap(),
        manager.get_study_status_list().await.unwrap()
    );
    assert_eq!(restored.snapshot().await.unwrap(), snapshot);
}

#[tokio::test]
async fn test_polling_round_joins_and_deploys() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let studies = vec![
        StudyKey::new(id, "smartphone"),
        // Not deployed by the host, joining keeps failing
        StudyKey::new(Uuid::new_v4(), "smartphone"),
    ];

    assert_eq!(poller::join_studies(&manager, &studies).await.unwrap(), 1);
    // Joined studies are not joined twice
    assert_eq!(poller::join_studies(&manager, &studies[..1]).await.unwrap(), 0);

    let summary = poller::poll_once(&manager).await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.running, 1);
    assert_eq!(summary.retryable_failures + summary.fatal_failures, 0);
}

#[tokio::test]
async fn test_rejected_reregistration_is_retried_from_scratch() {
    let host = host();
    let id = create(host.as_ref(), smartphone_depending_on_wearable()).await;
    host.register_device(id, "wearable", DeviceRegistration::new("watch-1"))
        .await
        .unwrap();
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();

    // Already used by the wearable
    manager.configure(DeviceRegistration::new("watch-1")).await.unwrap();
    assert!(matches!(
        manager.try_deployment(&key).await,
        Err(DeploymentError::InvalidArgument(_))
    ));

    manager.configure(DeviceRegistration::new("phone-3")).await.unwrap();
    assert_eq!(
        manager.try_deployment(&key).await.unwrap(),
        StudyStatus::AwaitingOtherDeviceDeployments
    );
    let deployment = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    assert_eq!(deployment.registration.device_id, "phone-3");
}

#[tokio::test]
async fn test_reregistration_after_host_dropped_the_device() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let manager = client(host.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();

    host.unregister_device(id, "smartphone").await.unwrap();
    manager.configure(DeviceRegistration::new("phone-2")).await.unwrap();

    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Running);
    let deployment = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    assert_eq!(deployment.registration.device_id, "phone-2");
}

#[tokio::test]
async fn test_confirmation_outdated_by_a_registration_is_retried() {
    let inner = host();
    let id = create(inner.as_ref(), smartphone_with_optional_wearable()).await;
    let service =
        Arc::new(InterferingHost::new(inner.clone()).registering_before_confirming("wearable", strap_registration()));
    let manager = client(service, Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();

    // The wearable registers after the phone fetched its deployment
    assert_eq!(
        manager.try_deployment(&key).await.unwrap(),
        StudyStatus::AwaitingDeviceDeployment
    );
    assert!(!inner.get_study_deployment_status(id).await.unwrap().is_running());

    assert_eq!(manager.try_deployment(&key).await.unwrap(), StudyStatus::Running);
    let deployment = inner.get_device_deployment_for(id, "smartphone").await.unwrap();
    assert!(deployment.connected_device_registrations.contains_key("wearable"));
}

#[tokio::test]
async fn test_deployment_for_another_role_is_inconsistent() {
    let inner = host();
    let id = create(inner.as_ref(), smartphone_depending_on_wearable()).await;
    inner
        .register_device(id, "wearable", DeviceRegistration::new("watch-1"))
        .await
        .unwrap();
    let service = Arc::new(InterferingHost::new(inner.clone()).handing_out_deployment_of("wearable"));
    let manager = client(service, Arc::new(full_capabilities()), phone_registration()).await;
    let key = StudyKey::new(id, "smartphone");
    manager.add_study(id, "smartphone").await.unwrap();

    assert!(matches!(
        manager.try_deployment(&key).await,
        Err(DeploymentError::Inconsistent(_))
    ));
    assert_eq!(
        manager.get_study_status(&key).await.unwrap(),
        StudyStatus::AwaitingDeviceDeployment
    );
}
