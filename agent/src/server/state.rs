//! Server state

use std::sync::Arc;

use crate::deployments::service::DeploymentService;
use crate::participants::service::ParticipationService;

/// Server state shared across handlers
pub struct ServerState {
    pub deployments: Arc<dyn DeploymentService>,
    pub participation: Arc<ParticipationService>,
}

impl ServerState {
    pub fn new(deployments: Arc<dyn DeploymentService>, participation: Arc<ParticipationService>) -> Self {
        Self {
            deployments,
            participation,
        }
    }
}
