//! Events raised by study deployments

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::errors::DeploymentError;
use crate::models::deployment::ConfigurationToken;
use crate::models::device::DeviceRegistration;
use crate::models::protocol::StudyProtocolSnapshot;
use crate::participants::accounts::ParticipantInvitation;

/// Something that happened to a study deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    Created {
        study_deployment_id: Uuid,
        protocol: Box<StudyProtocolSnapshot>,
        invitations: Vec<ParticipantInvitation>,
    },
    Removed {
        study_deployment_id: Uuid,
    },
    DeviceRegistrationChanged {
        study_deployment_id: Uuid,
        role_name: String,
        registration: Option<DeviceRegistration>,
    },
    DeviceDeployed {
        study_deployment_id: Uuid,
        role_name: String,
        token: ConfigurationToken,
    },
    DeploymentInvalidated {
        study_deployment_id: Uuid,
        role_name: String,
    },
    Started {
        study_deployment_id: Uuid,
        started_on: DateTime<Utc>,
    },
    Stopped {
        study_deployment_id: Uuid,
    },
}

impl DeploymentEvent {
    pub fn study_deployment_id(&self) -> Uuid {
        match self {
            DeploymentEvent::Created {
                study_deployment_id,
                ..
            }
            | DeploymentEvent::Removed {
                study_deployment_id,
            }
            | DeploymentEvent::DeviceRegistrationChanged {
                study_deployment_id,
                ..
            }
            | DeploymentEvent::DeviceDeployed {
                study_deployment_id,
                ..
            }
            | DeploymentEvent::DeploymentInvalidated {
                study_deployment_id,
                ..
            }
            | DeploymentEvent::Started {
                study_deployment_id,
                ..
            }
            | DeploymentEvent::Stopped {
                study_deployment_id,
            } => *study_deployment_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeploymentEvent::Created { .. } => "created",
            DeploymentEvent::Removed { .. } => "removed",
            DeploymentEvent::DeviceRegistrationChanged { .. } => "device_registration_changed",
            DeploymentEvent::DeviceDeployed { .. } => "device_deployed",
            DeploymentEvent::DeploymentInvalidated { .. } => "deployment_invalidated",
            DeploymentEvent::Started { .. } => "started",
            DeploymentEvent::Stopped { .. } => "stopped",
        }
    }
}

impl BusEvent for DeploymentEvent {
    fn name(&self) -> &'static str {
        DeploymentEvent::name(self)
    }

    fn study_deployment_id(&self) -> Uuid {
        DeploymentEvent::study_deployment_id(self)
    }
}

/// Event which can travel over an [`EventBus`]
pub trait BusEvent: Clone + Send + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    fn study_deployment_id(&self) -> Uuid;
}

/// Receives deployment events in process, in the order they were raised,
/// before they are broadcast
#[async_trait]
pub trait DeploymentEventHandler: Send + Sync {
    async fn handle_deployment_event(&self, event: &DeploymentEvent) -> Result<(), DeploymentError>;
}

/// Fan-out of events to whoever subscribed
#[derive(Debug, Clone)]
pub struct EventBus<E = DeploymentEvent> {
    sender: broadcast::Sender<E>,
}

impl<E: BusEvent> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish events in order; events without subscribers are dropped
    pub fn publish(&self, events: Vec<E>) {
        for event in events {
            debug!("Publishing {} event of {}", event.name(), event.study_deployment_id());
            let _ = self.sender.send(event);
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(256)
    }
}
