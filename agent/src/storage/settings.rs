//! Settings file management

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::capability::StaticDataCollector;
use crate::deployments::readiness::RedeploymentPolicy;
use crate::errors::DeploymentError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::device::DeviceRegistration;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log one JSON object per line
    #[serde(default)]
    pub json_logs: bool,

    /// Also write logs to the `logs` directory of the storage layout
    #[serde(default)]
    pub log_to_file: bool,

    /// Deployment host configuration, used with `--host`
    #[serde(default)]
    pub host: HostSettings,

    /// Where the device agent reaches the deployment host
    #[serde(default)]
    pub backend: BackendSettings,

    /// Interval between deployment attempts, in seconds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Registration this device registers with; generated on first start
    /// when absent
    #[serde(default)]
    pub device_registration: Option<DeviceRegistration>,

    /// Studies this device joins on start
    #[serde(default)]
    pub studies: Vec<StudySettings>,

    /// What this device can collect
    #[serde(default)]
    pub capabilities: StaticDataCollector,
}

fn default_polling_interval() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            host: HostSettings::default(),
            backend: BackendSettings::default(),
            polling_interval_secs: default_polling_interval(),
            device_registration: None,
            studies: Vec::new(),
            capabilities: StaticDataCollector::default(),
        }
    }
}

impl Settings {
    /// Read the settings file, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, DeploymentError> {
        let settings = file.read_json_opt::<Settings>().await?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), DeploymentError> {
        if self.polling_interval_secs == 0 {
            return Err(DeploymentError::ConfigError(
                "polling_interval_secs must be positive".to_string(),
            ));
        }
        if url::Url::parse(&self.backend.base_url).is_err() {
            return Err(DeploymentError::ConfigError(format!(
                "backend base_url '{}' is not a valid URL",
                self.backend.base_url
            )));
        }
        Ok(())
    }
}

/// Deployment host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Which registration changes send deployed devices back to redeployment
    #[serde(default)]
    pub redeployment_policy: RedeploymentPolicy,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redeployment_policy: RedeploymentPolicy::default(),
        }
    }
}

/// Backend API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL of the deployment host
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_backend_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_token: None,
        }
    }
}

/// A study this device participates in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySettings {
    pub study_deployment_id: Uuid,
    pub device_role_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "log_level": "debug",
                "host": { "redeployment_policy": "required_devices_only" },
                "studies": [
                    { "study_deployment_id": "00000000-0000-0000-0000-000000000000", "device_role_name": "phone" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.host.port, 8080);
        assert_eq!(settings.host.redeployment_policy, RedeploymentPolicy::RequiredDevicesOnly);
        assert_eq!(settings.polling_interval_secs, 30);
        assert_eq!(settings.studies[0].device_role_name, "phone");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_backend_url_is_rejected() {
        let mut settings = Settings::default();
        settings.backend.base_url = "not a url".to_string();
        assert!(matches!(settings.validate(), Err(DeploymentError::ConfigError(_))));
    }
}
