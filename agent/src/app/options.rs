//! Application configuration options

use std::time::Duration;

use crate::client::capability::StaticDataCollector;
use crate::client::study::StudyKey;
use crate::deployments::readiness::RedeploymentPolicy;
use crate::models::device::DeviceRegistration;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::poller;

/// What this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The deployment host: deployment and participation services over HTTP
    Host,

    /// A device taking part in studies of a remote deployment host
    Device,
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub mode: Mode,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Host mode only
    pub server: ServerOptions,
    pub host: HostOptions,

    /// Device mode only
    pub backend: BackendOptions,
    pub device: DeviceOptions,
    pub poller: poller::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Device,
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            server: ServerOptions::default(),
            host: HostOptions::default(),
            backend: BackendOptions::default(),
            device: DeviceOptions::default(),
            poller: poller::Options::default(),
        }
    }
}

impl AppOptions {
    pub fn from_settings(mode: Mode, layout: StorageLayout, settings: &Settings) -> Self {
        Self {
            mode,
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.host.host.clone(),
                port: settings.host.port,
            },
            host: HostOptions {
                redeployment_policy: settings.host.redeployment_policy,
                ..HostOptions::default()
            },
            backend: BackendOptions {
                base_url: settings.backend.base_url.clone(),
                api_token: settings.backend.api_token.clone(),
            },
            device: DeviceOptions {
                registration: settings.device_registration.clone(),
                capabilities: settings.capabilities.clone(),
            },
            poller: poller::Options {
                interval: Duration::from_secs(settings.polling_interval_secs),
                studies: settings
                    .studies
                    .iter()
                    .map(|s| StudyKey::new(s.study_deployment_id, s.device_role_name.clone()))
                    .collect(),
                ..poller::Options::default()
            },
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Deployment host options
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub redeployment_policy: RedeploymentPolicy,

    /// Deployment events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            redeployment_policy: RedeploymentPolicy::default(),
            event_capacity: 1024,
        }
    }
}

/// Where the device reaches the deployment host
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub base_url: String,
    pub api_token: Option<String>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            api_token: None,
        }
    }
}

/// Device identity and capabilities
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Registration to use; a stored or generated one when absent
    pub registration: Option<DeviceRegistration>,

    pub capabilities: StaticDataCollector,
}
