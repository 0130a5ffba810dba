//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions, Mode};
use crate::app::state::{DeviceState, HostState};
use crate::errors::DeploymentError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::poller;

/// Run the deployment host or the device agent until `shutdown_signal` fires
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeploymentError> {
    info!("Initializing study agent ({:?} mode)...", options.mode);

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let result = match options.mode {
        Mode::Host => init_host(&options, &shutdown_tx, &mut shutdown_manager).await,
        Mode::Device => init_device(&options, &shutdown_tx, &mut shutdown_manager).await,
    };
    if let Err(e) = result {
        error!("Failed to start study agent: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init_host(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DeploymentError> {
    let state = Arc::new(HostState::init(options));
    shutdown_manager.with_host_state(state.clone())?;

    init_server(options, state, shutdown_manager, shutdown_tx.subscribe()).await
}

async fn init_device(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DeploymentError> {
    let state = Arc::new(DeviceState::init(options).await?);
    shutdown_manager.with_device_state(state.clone())?;

    init_poller_worker(options.poller.clone(), state, shutdown_manager, shutdown_tx.subscribe())
}

async fn init_server(
    options: &AppOptions,
    state: Arc<HostState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploymentError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(state.deployments.clone(), state.participation.clone());

    let handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(handle)
}

fn init_poller_worker(
    options: poller::Options,
    state: Arc<DeviceState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploymentError> {
    info!("Initializing poller worker...");

    let manager = state.manager.clone();

    let handle = tokio::spawn(async move {
        poller::run(
            &options,
            manager.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_poller_worker_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    host_state: Option<Arc<HostState>>,
    device_state: Option<Arc<DeviceState>>,
    server_handle: Option<JoinHandle<Result<(), DeploymentError>>>,
    poller_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            host_state: None,
            device_state: None,
            server_handle: None,
            poller_worker_handle: None,
        }
    }

    fn with_host_state(&mut self, state: Arc<HostState>) -> Result<(), DeploymentError> {
        if self.host_state.is_some() {
            return Err(DeploymentError::ShutdownError("host_state already set".to_string()));
        }
        self.host_state = Some(state);
        Ok(())
    }

    fn with_device_state(&mut self, state: Arc<DeviceState>) -> Result<(), DeploymentError> {
        if self.device_state.is_some() {
            return Err(DeploymentError::ShutdownError("device_state already set".to_string()));
        }
        self.device_state = Some(state);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeploymentError>>,
    ) -> Result<(), DeploymentError> {
        if self.server_handle.is_some() {
            return Err(DeploymentError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    fn with_poller_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeploymentError> {
        if self.poller_worker_handle.is_some() {
            return Err(DeploymentError::ShutdownError("poller_handle already set".to_string()));
        }
        self.poller_worker_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DeploymentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeploymentError> {
        info!("Shutting down study agent...");

        // 1. Poller worker
        if let Some(handle) = self.poller_worker_handle.take() {
            handle.await.map_err(|e| DeploymentError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| DeploymentError::ShutdownError(e.to_string()))??;
        }

        // 3. State
        if let Some(state) = self.device_state.take() {
            state.shutdown().await?;
        }
        if let Some(state) = self.host_state.take() {
            state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
