use std::collections::BTreeSet;
use std::sync::Arc;

use study_agent::deployments::events::{DeploymentEvent, EventBus};
use study_agent::deployments::readiness::RedeploymentPolicy;
use study_agent::deployments::repository::InMemoryStudyDeploymentRepository;
use study_agent::deployments::service::{DeploymentService, DeploymentServiceHost};
use study_agent::errors::DeploymentError;
use study_agent::models::protocol::{AssignedTo, StudyProtocolSnapshot};
use study_agent::participants::accounts::{Account, AccountIdentity, AccountService, InMemoryAccountService, Participation, StudyInvitation};
use study_agent::participants::data::{ExpectedParticipantData, InputDataType, ParticipantAttribute, ParticipantData, SEX};
use study_agent::participants::group::{ParticipantDataEntry, ParticipantGroup, ParticipantGroupEvent};
use study_agent::participants::repository::{InMemoryParticipantGroupRepository, ParticipantGroupRepository};
use study_agent::participants::service::ParticipationService;
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

use crate::common::{create, phone_registration, smartphone_only};

fn protocol_expecting_sex() -> StudyProtocolSnapshot {
    let mut protocol = smartphone_only();
    protocol.expected_participant_data = vec![ExpectedParticipantData::new(
        ParticipantAttribute::Default {
            input_data_type: InputDataType::new(SEX),
        },
        AssignedTo::All,
    )];
    protocol
}

fn participation(study_deployment_id: Uuid, participant_id: Uuid) -> Participation {
    Participation {
        study_deployment_id,
        participant_id,
        assigned_roles: AssignedTo::All,
        assigned_primary_device_role_names: BTreeSet::from(["smartphone".to_string()]),
    }
}

fn account() -> Account {
    Account {
        id: Uuid::new_v4(),
        identity: AccountIdentity::email("participant@example.com"),
    }
}

fn female() -> Option<ParticipantData> {
    Some(ParticipantData::Selection {
        value: "female".to_string(),
    })
}

#[test]
fn test_duplicate_participation_emits_nothing() {
    let id = Uuid::new_v4();
    let mut group = ParticipantGroup::new(id, &smartphone_only());
    let participant_id = Uuid::new_v4();

    group
        .add_participation(&account(), StudyInvitation::new("Study"), participation(id, participant_id))
        .unwrap();
    let events = group.consume_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ParticipantGroupEvent::ParticipationAdded { .. }));

    let result = group.add_participation(&account(), StudyInvitation::new("Study"), participation(id, participant_id));
    assert!(matches!(result, Err(DeploymentError::InvalidArgument(_))));
    assert!(group.consume_events().is_empty());
    assert_eq!(group.participations().len(), 1);
}

#[test]
fn test_undeclared_input_type_is_rejected() {
    let mut group = ParticipantGroup::new(Uuid::new_v4(), &protocol_expecting_sex());

    let result = group.set_data(
        &InputDataType::new("favourite_colour"),
        Some(ParticipantData::Text {
            value: "green".to_string(),
        }),
        None,
    );
    assert!(matches!(result, Err(DeploymentError::InvalidArgument(_))));
    assert!(group.consume_events().is_empty());
}

#[test]
fn test_set_then_unset_restores_the_group() {
    let mut group = ParticipantGroup::new(Uuid::new_v4(), &protocol_expecting_sex());
    let before = group.data();
    let sex = InputDataType::new(SEX);

    assert!(group.set_data(&sex, female(), None).unwrap());
    assert_eq!(group.data()[0].data, female());
    assert!(group.set_data(&sex, None, None).unwrap());
    assert_eq!(group.data(), before);
}

#[test]
fn test_setting_the_same_value_twice_reports_no_change() {
    let mut group = ParticipantGroup::new(Uuid::new_v4(), &protocol_expecting_sex());
    let sex = InputDataType::new(SEX);

    assert!(group.set_data(&sex, female(), None).unwrap());
    assert!(!group.set_data(&sex, female(), None).unwrap());
    assert_eq!(group.consume_events().len(), 1);
}

struct Host {
    deployments: Arc<DeploymentServiceHost>,
    participation: Arc<ParticipationService>,
    groups: Arc<InMemoryParticipantGroupRepository>,
    accounts: Arc<InMemoryAccountService>,
    group_events: broadcast::Receiver<ParticipantGroupEvent>,
}

impl Host {
    fn new() -> Self {
        Self::with_event_capacity(256)
    }

    /// Deployment host handing its events to a participation service
    fn with_event_capacity(capacity: usize) -> Self {
        let groups = Arc::new(InMemoryParticipantGroupRepository::new());
        let accounts = Arc::new(InMemoryAccountService::new());
        let participation = Arc::new(ParticipationService::new(groups.clone(), accounts.clone()));
        let deployments = Arc::new(
            DeploymentServiceHost::new(
                Arc::new(InMemoryStudyDeploymentRepository::new()),
                EventBus::new(capacity),
                RedeploymentPolicy::default(),
            )
            .with_handler(participation.clone()),
        );
        let group_events = participation.events().subscribe();
        Self {
            deployments,
            participation,
            groups,
            accounts,
            group_events,
        }
    }

    fn group_events(&mut self) -> Vec<ParticipantGroupEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.group_events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn account_id(&self) -> Uuid {
        self.accounts
            .find_account(&AccountIdentity::email("participant@example.com"))
            .await
            .unwrap()
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn test_created_deployment_invites_participants() {
    let host = Host::new();
    let id = create(host.deployments.as_ref(), smartphone_only()).await;

    let invitations = host
        .participation
        .get_active_participation_invitations(host.account_id().await)
        .await
        .unwrap();
    assert_eq!(invitations.len(), 1);
    assert_eq!(invitations[0].participation.study_deployment_id, id);
    assert_eq!(invitations[0].assigned_devices.len(), 1);
    assert_eq!(invitations[0].assigned_devices[0].role_name, "smartphone");
}

#[tokio::test]
async fn test_group_follows_device_registrations() {
    let host = Host::new();
    let id = create(host.deployments.as_ref(), smartphone_only()).await;
    host.deployments
        .register_device(id, "smartphone", phone_registration())
        .await
        .unwrap();

    let group = host.groups.get(id).await.unwrap().unwrap();
    let phone = &group.assigned_primary_devices()[0];
    assert_eq!(phone.registration.as_ref().map(|r| r.device_id.as_str()), Some("phone-1"));

    host.deployments.unregister_device(id, "smartphone").await.unwrap();
    let group = host.groups.get(id).await.unwrap().unwrap();
    assert!(group.assigned_primary_devices()[0].registration.is_none());
}

#[tokio::test]
async fn test_stopped_deployment_is_no_longer_active() {
    let host = Host::new();
    let id = create(host.deployments.as_ref(), smartphone_only()).await;
    host.deployments.stop(id).await.unwrap();

    assert!(host.groups.get(id).await.unwrap().unwrap().is_study_deployment_stopped());
    let invitations = host
        .participation
        .get_active_participation_invitations(host.account_id().await)
        .await
        .unwrap();
    assert!(invitations.is_empty());
}

#[tokio::test]
async fn test_removed_deployment_drops_its_group() {
    let host = Host::new();
    let id = create(host.deployments.as_ref(), smartphone_only()).await;
    assert!(host.groups.get(id).await.unwrap().is_some());

    host.deployments.remove_study_deployments(&[id]).await.unwrap();
    assert!(host.groups.get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_participant_data_through_the_service() {
    let host = Host::new();
    let id = create(host.deployments.as_ref(), protocol_expecting_sex()).await;

    let data = host
        .participation
        .set_participant_data(
            id,
            vec![ParticipantDataEntry {
                input_data_type: InputDataType::new(SEX),
                role: None,
                data: female(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(data[0].data, female());
    assert_eq!(host.participation.get_participant_data(id).await.unwrap(), data);

    // Values outside the select options are refused
    let result = host
        .participation
        .set_participant_data(
            id,
            vec![ParticipantDataEntry {
                input_data_type: InputDataType::new(SEX),
                role: None,
                data: Some(ParticipantData::Selection {
                    value: "unknown".to_string(),
                }),
            }],
        )
        .await;
    assert!(matches!(result, Err(DeploymentError::InvalidArgument(_))));

    assert!(matches!(
        host.participation.get_participant_data(Uuid::new_v4()).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_group_events_are_published_once_stored() {
    let mut host = Host::new();
    let id = create(host.deployments.as_ref(), smartphone_only()).await;

    let events = host.group_events();
    assert_eq!(events.len(), 1);
    let ParticipantGroupEvent::ParticipationAdded {
        study_deployment_id,
        ..
    } = &events[0]
    else {
        panic!("unexpected event {:?}", events[0]);
    };
    assert_eq!(*study_deployment_id, id);
    assert!(matches!(host.group_events.try_recv(), Err(TryRecvError::Empty)));

    host.deployments
        .register_device(id, "smartphone", phone_registration())
        .await
        .unwrap();
    // Identical registrations change nothing
    host.deployments
        .register_device(id, "smartphone", phone_registration())
        .await
        .unwrap();
    let events = host.group_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        ParticipantGroupEvent::DeviceRegistrationChanged { .. }
    ));
}

#[tokio::test]
async fn test_group_stays_in_step_when_broadcast_lags() {
    let host = Host::with_event_capacity(1);
    // Never read, so it falls behind right away
    let mut lagging: broadcast::Receiver<DeploymentEvent> = host.deployments.events().subscribe();

    let id = create(host.deployments.as_ref(), smartphone_only()).await;
    host.deployments
        .register_device(id, "smartphone", phone_registration())
        .await
        .unwrap();
    host.deployments.stop(id).await.unwrap();

    assert!(matches!(lagging.try_recv(), Err(TryRecvError::Lagged(_))));
    let group = host.groups.get(id).await.unwrap().unwrap();
    assert!(group.is_study_deployment_stopped());
    assert!(group.assigned_primary_devices()[0].registration.is_some());
}
