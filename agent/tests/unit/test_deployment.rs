use std::collections::BTreeMap;

use study_agent::deployments::events::DeploymentEvent;
use study_agent::deployments::readiness::RedeploymentPolicy;
use study_agent::deployments::service::DeploymentService;
use study_agent::errors::DeploymentError;
use study_agent::models::device::DeviceRegistration;
use study_agent::models::status::{DeviceDeploymentStatus, StudyDeploymentStatus};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use crate::common::{
    create, host, host_with_policy, invitation, phone_registration, smartphone_depending_on_wearable,
    smartphone_only, smartphone_with_connected_wearable, smartphone_with_optional_wearable, strap_registration,
};

#[tokio::test]
async fn test_new_deployment_is_invited() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;

    let status = host.get_study_deployment_status(id).await.unwrap();
    assert!(matches!(status, StudyDeploymentStatus::Invited(_)));
    assert_eq!(status.study_deployment_id(), id);
}

#[tokio::test]
async fn test_invalid_protocol_is_rejected() {
    let host = host();
    let mut protocol = smartphone_only();
    protocol.primary_devices.clear();

    let result = host
        .create_study_deployment(Uuid::new_v4(), protocol, vec![invitation("a@example.com")], BTreeMap::new())
        .await;
    assert!(matches!(result, Err(DeploymentError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_duplicate_deployment_id_is_rejected() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;

    let result = host
        .create_study_deployment(id, smartphone_only(), vec![invitation("a@example.com")], BTreeMap::new())
        .await;
    assert!(matches!(result, Err(DeploymentError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_single_primary_device_has_no_unmet_dependencies() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;

    let status = host.register_device(id, "smartphone", phone_registration()).await.unwrap();
    let device = status.device_status("smartphone").unwrap();
    assert!(device.can_obtain_device_deployment());
    assert!(device.can_deploy());
    assert!(device.remaining_devices_to_register_before_deployment().is_empty());

    let deployment = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    let status = host
        .deployment_successful(id, "smartphone", deployment.last_update)
        .await
        .unwrap();
    assert!(status.is_running());
}

#[tokio::test]
async fn test_dependent_primary_waits_for_its_source() {
    let host = host();
    let id = create(host.as_ref(), smartphone_depending_on_wearable()).await;

    let status = host.register_device(id, "smartphone", phone_registration()).await.unwrap();
    let phone = status.device_status("smartphone").unwrap();
    assert!(!phone.can_obtain_device_deployment());
    assert!(phone
        .remaining_devices_to_register_before_deployment()
        .contains("wearable"));
    assert!(matches!(
        host.get_device_deployment_for(id, "smartphone").await,
        Err(DeploymentError::InvalidState(_))
    ));

    let status = host
        .register_device(id, "wearable", DeviceRegistration::new("watch-1"))
        .await
        .unwrap();
    let phone = status.device_status("smartphone").unwrap();
    assert!(phone.can_obtain_device_deployment());
    assert!(phone.remaining_devices_to_register_before_deployment().is_empty());
}

#[tokio::test]
async fn test_running_once_every_primary_deployed() {
    let host = host();
    let id = create(host.as_ref(), smartphone_depending_on_wearable()).await;
    host.register_device(id, "smartphone", phone_registration()).await.unwrap();
    host.register_device(id, "wearable", DeviceRegistration::new("watch-1"))
        .await
        .unwrap();

    let phone = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    let status = host
        .deployment_successful(id, "smartphone", phone.last_update)
        .await
        .unwrap();
    assert!(matches!(status, StudyDeploymentStatus::DeployingDevices(_)));

    let watch = host.get_device_deployment_for(id, "wearable").await.unwrap();
    let status = host
        .deployment_successful(id, "wearable", watch.last_update)
        .await
        .unwrap();
    assert!(status.is_running());
}

#[tokio::test]
async fn test_connected_devices_are_part_of_the_primary_deployment() {
    let host = host();
    let id = create(host.as_ref(), smartphone_with_connected_wearable()).await;
    host.register_device(id, "smartphone", phone_registration()).await.unwrap();

    // The phone may fetch its deployment before the wearable registers ...
    let status = host.get_study_deployment_status(id).await.unwrap();
    let phone = status.device_status("smartphone").unwrap();
    assert!(phone.can_obtain_device_deployment());
    assert!(!phone.can_deploy());
    assert!(phone
        .remaining_devices_to_register_before_deployment()
        .contains("wearable"));

    // ... but only deploys once it registered
    let status = host.register_device(id, "wearable", strap_registration()).await.unwrap();
    let wearable = status.device_status("wearable").unwrap();
    assert!(!wearable.requires_deployment());

    let deployment = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    assert_eq!(deployment.connected_devices.len(), 1);
    assert!(deployment.connected_device_registrations.contains_key("wearable"));
    assert_eq!(deployment.tasks.len(), 2);

    assert!(matches!(
        host.get_device_deployment_for(id, "wearable").await,
        Err(DeploymentError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_identical_registration_is_a_no_op() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let mut events = host.events().subscribe();

    let registration = phone_registration();
    let first = host.register_device(id, "smartphone", registration.clone()).await.unwrap();
    assert!(matches!(
        events.try_recv(),
        Ok(DeploymentEvent::DeviceRegistrationChanged { .. })
    ));

    let second = host.register_device(id, "smartphone", registration).await.unwrap();
    assert_eq!(first, second);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_reregistration_requires_unregistering() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    host.register_device(id, "smartphone", phone_registration()).await.unwrap();

    // A different registration is refused while one is active
    let other = DeviceRegistration::new("phone-2");
    assert!(matches!(
        host.register_device(id, "smartphone", other.clone()).await,
        Err(DeploymentError::InvalidState(_))
    ));

    assert_ok!(host.unregister_device(id, "smartphone").await);
    // Unregistering twice is refused
    assert_err!(host.unregister_device(id, "smartphone").await);
    let status = assert_ok!(host.register_device(id, "smartphone", other).await);
    assert!(status.device_status("smartphone").unwrap().is_registered());
}

#[tokio::test]
async fn test_device_id_collision_is_rejected() {
    let host = host();
    let id = create(host.as_ref(), smartphone_depending_on_wearable()).await;
    host.register_device(id, "smartphone", phone_registration()).await.unwrap();

    let result = host.register_device(id, "wearable", phone_registration()).await;
    assert!(matches!(result, Err(DeploymentError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_unknown_role_and_deployment_are_rejected() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;

    assert!(matches!(
        host.register_device(id, "tablet", phone_registration()).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.get_study_deployment_status(Uuid::new_v4()).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.get_study_deployment_status_list(&[id, Uuid::new_v4()]).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_stale_configuration_token_is_rejected() {
    let host = host();
    let id = create(host.as_ref(), smartphone_with_connected_wearable()).await;
    host.register_device(id, "smartphone", phone_registration()).await.unwrap();

    // Fetched before the wearable registered
    let early = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    host.register_device(id, "wearable", strap_registration()).await.unwrap();

    assert!(matches!(
        host.deployment_successful(id, "smartphone", early.last_update).await,
        Err(DeploymentError::InvalidState(_))
    ));

    let current = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    assert_ne!(early.last_update, current.last_update);
    let status = host
        .deployment_successful(id, "smartphone", current.last_update)
        .await
        .unwrap();
    assert!(status.is_running());
}

async fn deploy_phone_then_register_strap(policy: RedeploymentPolicy) -> DeviceDeploymentStatus {
    let host = host_with_policy(policy);
    let id = create(host.as_ref(), smartphone_with_optional_wearable()).await;
    host.register_device(id, "smartphone", phone_registration()).await.unwrap();
    let deployment = host.get_device_deployment_for(id, "smartphone").await.unwrap();
    host.deployment_successful(id, "smartphone", deployment.last_update)
        .await
        .unwrap();

    let status = host.register_device(id, "wearable", strap_registration()).await.unwrap();
    status.device_status("smartphone").unwrap().clone()
}

#[tokio::test]
async fn test_optional_device_invalidates_under_default_policy() {
    let phone = deploy_phone_then_register_strap(RedeploymentPolicy::AnyIncludedDevice).await;
    assert!(matches!(phone, DeviceDeploymentStatus::NeedsRedeployment { .. }));
}

#[tokio::test]
async fn test_optional_device_is_ignored_under_required_only_policy() {
    let phone = deploy_phone_then_register_strap(RedeploymentPolicy::RequiredDevicesOnly).await;
    assert!(matches!(phone, DeviceDeploymentStatus::Deployed { .. }));
}

#[tokio::test]
async fn test_stopped_deployment_rejects_registrations() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;

    let status = host.stop(id).await.unwrap();
    assert!(status.is_stopped());
    // Stopping twice is fine
    assert!(assert_ok!(host.stop(id).await).is_stopped());

    assert!(matches!(
        host.register_device(id, "smartphone", phone_registration()).await,
        Err(DeploymentError::Stopped(_))
    ));
}

#[tokio::test]
async fn test_preregistered_connected_device() {
    let host = host();
    let id = Uuid::new_v4();
    let preregistrations = BTreeMap::from([("wearable".to_string(), strap_registration())]);

    let status = host
        .create_study_deployment(
            id,
            smartphone_with_connected_wearable(),
            vec![invitation("a@example.com")],
            preregistrations,
        )
        .await
        .unwrap();
    assert!(status.device_status("wearable").unwrap().is_registered());

    let status = host.register_device(id, "smartphone", phone_registration()).await.unwrap();
    assert!(status.device_status("smartphone").unwrap().can_deploy());
}

#[tokio::test]
async fn test_remove_returns_existing_ids_only() {
    let host = host();
    let id = create(host.as_ref(), smartphone_only()).await;
    let mut events = host.events().subscribe();

    let removed = host.remove_study_deployments(&[id, Uuid::new_v4()]).await.unwrap();
    assert_eq!(removed, vec![id]);
    assert!(matches!(events.try_recv(), Ok(DeploymentEvent::Removed { .. })));
    assert!(host.remove_study_deployments(&[id]).await.unwrap().is_empty());
}
