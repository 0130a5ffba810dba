//! Polling worker driving studies towards deployment

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::client::manager::ClientManager;
use crate::client::study::{StudyKey, StudyStatus};
use crate::errors::DeploymentError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Poller worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Initial delay before first poll
    pub initial_delay: Duration,

    /// Back-off after transport failures
    pub cooldown: CooldownOptions,

    /// Studies to join when not joined yet
    pub studies: Vec<StudyKey>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(1),
            cooldown: CooldownOptions::default(),
            studies: Vec::new(),
        }
    }
}

/// Outcome of one polling round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    /// Studies attempted
    pub attempted: usize,

    /// Studies running after the round
    pub running: usize,

    /// Attempts which may succeed when retried
    pub retryable_failures: usize,

    /// Attempts which will keep failing, e.g. unsupported capabilities
    pub fatal_failures: usize,
}

/// Join the studies in `studies` which were not joined yet; returns how many
/// could not be joined for now
pub async fn join_studies(manager: &ClientManager, studies: &[StudyKey]) -> Result<usize, DeploymentError> {
    let mut failed = 0;
    for key in studies {
        if manager.contains_study(key).await? {
            continue;
        }
        match manager.add_study(key.study_deployment_id, &key.device_role_name).await {
            Ok(status) => info!("Joined study {} ({})", key, status.name()),
            Err(e) => {
                failed += 1;
                warn!("Failed to join study {}: {}", key, e);
            }
        }
    }
    Ok(failed)
}

/// Try to deploy every study which is not stopped; deployed studies only
/// refresh their status, which picks up redeployments requested by the host.
/// Stopped studies stay in the client untouched until they are removed.
pub async fn poll_once(manager: &ClientManager) -> Result<PollSummary, DeploymentError> {
    let pending: Vec<_> = manager
        .get_study_status_list()
        .await?
        .into_iter()
        .filter(|(_, status)| *status != StudyStatus::Stopped)
        .map(|(key, _)| key)
        .collect();

    let results = join_all(pending.iter().map(|key| manager.try_deployment(key))).await;

    let mut summary = PollSummary {
        attempted: pending.len(),
        ..Default::default()
    };
    for (key, result) in pending.iter().zip(results) {
        match result {
            Ok(StudyStatus::Running) => summary.running += 1,
            Ok(status) => debug!("Study {} is {}", key, status.name()),
            Err(e) if e.is_retryable() => {
                summary.retryable_failures += 1;
                warn!("Deployment attempt of study {} failed: {}", key, e);
            }
            Err(e) => {
                summary.fatal_failures += 1;
                error!("Study {} cannot be deployed: {}", key, e);
            }
        }
    }
    Ok(summary)
}

/// Run the poller worker
pub async fn run<S, F>(
    options: &Options,
    manager: &ClientManager,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Poller worker starting...");

    let mut delay = options.initial_delay;
    let mut failed_attempts: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Poller worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }

        let join_failed = match join_studies(manager, &options.studies).await {
            Ok(failed) => failed > 0,
            Err(e) => {
                error!("Failed to join studies: {}", e);
                true
            }
        };

        let transport_failed = match poll_once(manager).await {
            Ok(summary) => {
                debug!("Polling round finished: {:?}", summary);
                join_failed || summary.retryable_failures > 0
            }
            Err(e) => {
                error!("Polling round failed: {}", e);
                true
            }
        };

        delay = if transport_failed {
            let backoff = calc_exp_backoff(&options.cooldown, failed_attempts);
            failed_attempts = failed_attempts.saturating_add(1);
            debug!("Retrying in {:?}", backoff);
            backoff
        } else {
            failed_attempts = 0;
            options.interval
        };
    }
}
