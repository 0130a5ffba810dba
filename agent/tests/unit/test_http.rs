use std::collections::BTreeMap;
use std::sync::Arc;

use study_agent::client::study::{StudyKey, StudyStatus};
use study_agent::deployments::service::DeploymentService;
use study_agent::errors::DeploymentError;
use study_agent::http::client::HttpClient;
use study_agent::http::deployments::HttpDeploymentService;
use study_agent::participants::accounts::InMemoryAccountService;
use study_agent::participants::repository::InMemoryParticipantGroupRepository;
use study_agent::participants::service::ParticipationService;
use study_agent::server::serve::router;
use study_agent::server::state::ServerState;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::common::{client, full_capabilities, host, invitation, phone_registration, smartphone_only};

/// Serve a fresh deployment host on a random local port
async fn remote_host() -> HttpDeploymentService {
    let participation = Arc::new(ParticipationService::new(
        Arc::new(InMemoryParticipantGroupRepository::new()),
        Arc::new(InMemoryAccountService::new()),
    ));
    let state = Arc::new(ServerState::new(host(), participation));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    let client = HttpClient::new(&format!("http://{}/api/v1", addr), None).unwrap();
    HttpDeploymentService::new(client)
}

#[tokio::test]
async fn test_device_deploys_through_remote_host() {
    let service = Arc::new(remote_host().await);
    let id = Uuid::new_v4();
    let status = service
        .create_study_deployment(id, smartphone_only(), vec![invitation("a@example.com")], BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(status.study_deployment_id(), id);

    let manager = client(service.clone(), Arc::new(full_capabilities()), phone_registration()).await;
    manager.add_study(id, "smartphone").await.unwrap();
    let status = manager.try_deployment(&StudyKey::new(id, "smartphone")).await.unwrap();
    assert_eq!(status, StudyStatus::Running);

    let statuses = service.get_study_deployment_status_list(&[id]).await.unwrap();
    assert!(statuses[0].is_running());
}

#[tokio::test]
async fn test_remote_errors_keep_their_category() {
    let service = remote_host().await;
    let id = Uuid::new_v4();
    service
        .create_study_deployment(id, smartphone_only(), vec![invitation("a@example.com")], BTreeMap::new())
        .await
        .unwrap();

    assert!(matches!(
        service.register_device(id, "tablet", phone_registration()).await,
        Err(DeploymentError::InvalidArgument(_))
    ));

    service.stop(id).await.unwrap();
    assert!(matches!(
        service.register_device(id, "smartphone", phone_registration()).await,
        Err(DeploymentError::Stopped(_))
    ));

    assert_eq!(service.remove_study_deployments(&[id]).await.unwrap(), vec![id]);
    assert!(matches!(
        service.get_study_deployment_status(id).await,
        Err(DeploymentError::InvalidArgument(_))
    ));
}
