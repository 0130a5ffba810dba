//! Shared fixtures

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use study_agent::client::capability::{DeviceDataCollector, StaticDataCollector};
use study_agent::client::manager::ClientManager;
use study_agent::client::repository::InMemoryClientRepository;
use study_agent::deployments::events::EventBus;
use study_agent::deployments::readiness::RedeploymentPolicy;
use study_agent::deployments::repository::InMemoryStudyDeploymentRepository;
use study_agent::deployments::service::{DeploymentService, DeploymentServiceHost};
use study_agent::models::device::{DataType, DeviceConfiguration, DeviceKind, DeviceRegistration};
use study_agent::models::protocol::{
    AssignedTo, Control, DeviceConnection, Measure, StudyProtocolSnapshot, TaskConfiguration, TaskControl,
    TriggerConfiguration, TriggerKind,
};
use study_agent::participants::accounts::{AccountIdentity, ParticipantInvitation, StudyInvitation};
use uuid::Uuid;

pub fn invitation(email: &str) -> ParticipantInvitation {
    ParticipantInvitation {
        participant_id: Uuid::new_v4(),
        assigned_roles: AssignedTo::All,
        identity: AccountIdentity::email(email),
        invitation: StudyInvitation::new("Sleep study"),
    }
}

pub fn host() -> Arc<DeploymentServiceHost> {
    host_with_policy(RedeploymentPolicy::default())
}

pub fn host_with_policy(policy: RedeploymentPolicy) -> Arc<DeploymentServiceHost> {
    Arc::new(DeploymentServiceHost::new(
        Arc::new(InMemoryStudyDeploymentRepository::new()),
        EventBus::default(),
        policy,
    ))
}

pub async fn create(service: &dyn DeploymentService, protocol: StudyProtocolSnapshot) -> Uuid {
    let id = Uuid::new_v4();
    service
        .create_study_deployment(id, protocol, vec![invitation("participant@example.com")], BTreeMap::new())
        .await
        .unwrap();
    id
}

fn measuring_task(name: &str, data_type: &str) -> TaskConfiguration {
    TaskConfiguration {
        name: name.to_string(),
        description: None,
        measures: vec![Measure {
            data_type: DataType::new(data_type),
        }],
    }
}

fn start_on(protocol: &mut StudyProtocolSnapshot, trigger_id: u32, source: &str, task: &str, destination: &str) {
    protocol.triggers.insert(
        trigger_id,
        TriggerConfiguration {
            source_device_role_name: source.to_string(),
            kind: TriggerKind::ElapsedTime { elapsed_secs: 0 },
        },
    );
    protocol.task_controls.push(TaskControl {
        trigger_id,
        task_name: task.to_string(),
        destination_device_role_name: destination.to_string(),
        control: Control::Start,
    });
}

/// A smartphone collecting its location
pub fn smartphone_only() -> StudyProtocolSnapshot {
    let mut protocol = StudyProtocolSnapshot::new(
        "Smartphone only",
        DeviceConfiguration::new("smartphone", DeviceKind::Smartphone),
    );
    protocol.tasks.push(measuring_task("track", "geolocation"));
    start_on(&mut protocol, 1, "smartphone", "track", "smartphone");
    protocol
}

/// A smartphone relaying heart rate from a connected wearable
pub fn smartphone_with_connected_wearable() -> StudyProtocolSnapshot {
    let mut protocol = smartphone_only();
    protocol
        .connected_devices
        .push(DeviceConfiguration::new("wearable", DeviceKind::BleHeartRate));
    protocol.connections.push(DeviceConnection {
        role_name: "wearable".to_string(),
        connected_to_role_name: "smartphone".to_string(),
    });
    protocol.tasks.push(measuring_task("heart", "heartrate"));
    start_on(&mut protocol, 2, "smartphone", "heart", "wearable");
    protocol
}

/// Same as [`smartphone_with_connected_wearable`], but the wearable is optional
pub fn smartphone_with_optional_wearable() -> StudyProtocolSnapshot {
    let mut protocol = smartphone_with_connected_wearable();
    protocol.connected_devices = vec![DeviceConfiguration::new("wearable", DeviceKind::BleHeartRate).optional()];
    protocol
}

/// A smartphone whose task is started by a trigger on a second primary device
pub fn smartphone_depending_on_wearable() -> StudyProtocolSnapshot {
    let mut protocol = StudyProtocolSnapshot::new(
        "Smartphone depending on wearable",
        DeviceConfiguration::new("smartphone", DeviceKind::Smartphone),
    );
    protocol.primary_devices.push(DeviceConfiguration::new(
        "wearable",
        DeviceKind::Custom {
            type_name: "smartwatch".to_string(),
        },
    ));
    protocol.tasks.push(measuring_task("track", "geolocation"));
    start_on(&mut protocol, 1, "wearable", "track", "smartphone");
    protocol
}

pub fn phone_registration() -> DeviceRegistration {
    DeviceRegistration::new("phone-1")
}

pub fn strap_registration() -> DeviceRegistration {
    DeviceRegistration::mac_address("00:11:22:33:44:55")
}

/// Capability collaborator counting how often deployments are validated
pub struct CountingCollector {
    inner: StaticDataCollector,
    pub data_type_checks: AtomicUsize,
}

impl CountingCollector {
    pub fn new(inner: StaticDataCollector) -> Self {
        Self {
            inner,
            data_type_checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.data_type_checks.load(Ordering::SeqCst)
    }
}

impl DeviceDataCollector for CountingCollector {
    fn supports_connected_device(&self, kind: &DeviceKind, registration: &DeviceRegistration) -> bool {
        self.inner.supports_connected_device(kind, registration)
    }

    fn supports_data_type(&self, data_type: &DataType) -> bool {
        self.data_type_checks.fetch_add(1, Ordering::SeqCst);
        self.inner.supports_data_type(data_type)
    }

    fn supports_connected_data_type(&self, kind: &DeviceKind, data_type: &DataType) -> bool {
        self.data_type_checks.fetch_add(1, Ordering::SeqCst);
        self.inner.supports_connected_data_type(kind, data_type)
    }
}

pub fn full_capabilities() -> StaticDataCollector {
    StaticDataCollector::new()
        .with_local(["geolocation"])
        .with_connected(&DeviceKind::BleHeartRate, ["heartrate"])
}

/// Client of a device registered as `registration`
pub async fn client(
    service: Arc<dyn DeploymentService>,
    collector: Arc<dyn DeviceDataCollector>,
    registration: DeviceRegistration,
) -> ClientManager {
    let manager = ClientManager::new(service, Arc::new(InMemoryClientRepository::new()), collector);
    manager.configure(registration).await.unwrap();
    manager
}
