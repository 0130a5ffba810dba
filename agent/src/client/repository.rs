//! Storage of the studies this device participates in

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::study::{ClientStudy, StudyKey, StudySnapshot};
use crate::errors::DeploymentError;
use crate::filesys::file::File;
use crate::models::device::DeviceRegistration;

/// Serializable state of the whole client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_registration: Option<DeviceRegistration>,

    #[serde(default)]
    pub studies: Vec<StudySnapshot>,
}

#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn get_device_registration(&self) -> Result<Option<DeviceRegistration>, DeploymentError>;

    async fn set_device_registration(&self, registration: DeviceRegistration) -> Result<(), DeploymentError>;

    /// Add a new study; fails when one with the same key is stored
    async fn add_study(&self, study: &ClientStudy) -> Result<(), DeploymentError>;

    async fn get_study(&self, key: &StudyKey) -> Result<Option<ClientStudy>, DeploymentError>;

    async fn get_study_list(&self) -> Result<Vec<ClientStudy>, DeploymentError>;

    /// Replace a stored study; fails when it is not stored
    async fn update_study(&self, study: &ClientStudy) -> Result<(), DeploymentError>;

    /// Returns whether the study was stored
    async fn remove_study(&self, key: &StudyKey) -> Result<bool, DeploymentError>;
}

/// In-memory state shared by both repositories
#[derive(Debug, Default)]
struct ClientState {
    device_registration: Option<DeviceRegistration>,
    studies: BTreeMap<StudyKey, StudySnapshot>,
}

impl ClientState {
    fn from_snapshot(snapshot: ClientSnapshot) -> Result<Self, DeploymentError> {
        let mut studies = BTreeMap::new();
        for study in snapshot.studies {
            let key = StudyKey::new(study.study_deployment_id, study.device_role_name.clone());
            if studies.insert(key.clone(), study).is_some() {
                return Err(DeploymentError::StorageError(format!("study {} is stored twice", key)));
            }
        }
        Ok(Self {
            device_registration: snapshot.device_registration,
            studies,
        })
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            device_registration: self.device_registration.clone(),
            studies: self.studies.values().cloned().collect(),
        }
    }

    fn add(&mut self, study: &ClientStudy) -> Result<(), DeploymentError> {
        if self.studies.contains_key(study.key()) {
            return Err(DeploymentError::InvalidArgument(format!(
                "study {} was already added",
                study.key()
            )));
        }
        self.studies.insert(study.key().clone(), study.snapshot());
        Ok(())
    }

    fn update(&mut self, study: &ClientStudy) -> Result<(), DeploymentError> {
        match self.studies.get_mut(study.key()) {
            Some(stored) => {
                *stored = study.snapshot();
                Ok(())
            }
            None => Err(DeploymentError::InvalidArgument(format!(
                "study {} does not exist",
                study.key()
            ))),
        }
    }

    fn get(&self, key: &StudyKey) -> Result<Option<ClientStudy>, DeploymentError> {
        self.studies
            .get(key)
            .cloned()
            .map(ClientStudy::from_snapshot)
            .transpose()
    }

    fn list(&self) -> Result<Vec<ClientStudy>, DeploymentError> {
        self.studies
            .values()
            .cloned()
            .map(ClientStudy::from_snapshot)
            .collect()
    }
}

/// Repository keeping client state in memory
#[derive(Default)]
pub struct InMemoryClientRepository {
    state: RwLock<ClientState>,
}

impl InMemoryClientRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientRepository for InMemoryClientRepository {
    async fn get_device_registration(&self) -> Result<Option<DeviceRegistration>, DeploymentError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.device_registration.clone())
    }

    async fn set_device_registration(&self, registration: DeviceRegistration) -> Result<(), DeploymentError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.device_registration = Some(registration);
        Ok(())
    }

    async fn add_study(&self, study: &ClientStudy) -> Result<(), DeploymentError> {
        self.state.write().unwrap_or_else(|e| e.into_inner()).add(study)
    }

    async fn get_study(&self, key: &StudyKey) -> Result<Option<ClientStudy>, DeploymentError> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).get(key)
    }

    async fn get_study_list(&self) -> Result<Vec<ClientStudy>, DeploymentError> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).list()
    }

    async fn update_study(&self, study: &ClientStudy) -> Result<(), DeploymentError> {
        self.state.write().unwrap_or_else(|e| e.into_inner()).update(study)
    }

    async fn remove_study(&self, key: &StudyKey) -> Result<bool, DeploymentError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        Ok(state.studies.remove(key).is_some())
    }
}

/// Repository persisting client state to a JSON file
///
/// The file is read on first access and rewritten after every change.
pub struct FileClientRepository {
    file: File,
    state: Mutex<Option<ClientState>>,
}

impl FileClientRepository {
    pub fn new(file: File) -> Self {
        Self {
            file,
            state: Mutex::new(None),
        }
    }

    async fn with_state<T, F>(&self, persist: bool, f: F) -> Result<T, DeploymentError>
    where
        F: FnOnce(&mut ClientState) -> Result<T, DeploymentError>,
    {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let snapshot = self
                .file
                .read_json_opt::<ClientSnapshot>()
                .await
                .map_err(|e| {
                    DeploymentError::StorageError(format!(
                        "failed to read {}: {}",
                        self.file.path().display(),
                        e
                    ))
                })?
                .unwrap_or_default();
            *guard = Some(ClientState::from_snapshot(snapshot)?);
        }

        let Some(state) = guard.as_mut() else {
            return Err(DeploymentError::Internal("client state not loaded".to_string()));
        };
        let value = f(state)?;
        if persist {
            self.file.write_json(&state.snapshot()).await?;
            debug!("Stored client state in {}", self.file.path().display());
        }
        Ok(value)
    }
}

#[async_trait]
impl ClientRepository for FileClientRepository {
    async fn get_device_registration(&self) -> Result<Option<DeviceRegistration>, DeploymentError> {
        self.with_state(false, |state| Ok(state.device_registration.clone()))
            .await
    }

    async fn set_device_registration(&self, registration: DeviceRegistration) -> Result<(), DeploymentError> {
        self.with_state(true, |state| {
            state.device_registration = Some(registration);
            Ok(())
        })
        .await
    }

    async fn add_study(&self, study: &ClientStudy) -> Result<(), DeploymentError> {
        self.with_state(true, |state| state.add(study)).await
    }

    async fn get_study(&self, key: &StudyKey) -> Result<Option<ClientStudy>, DeploymentError> {
        self.with_state(false, |state| state.get(key)).await
    }

    async fn get_study_list(&self) -> Result<Vec<ClientStudy>, DeploymentError> {
        self.with_state(false, |state| state.list()).await
    }

    async fn update_study(&self, study: &ClientStudy) -> Result<(), DeploymentError> {
        self.with_state(true, |state| state.update(study)).await
    }

    async fn remove_study(&self, key: &StudyKey) -> Result<bool, DeploymentError> {
        self.with_state(true, |state| Ok(state.studies.remove(key).is_some()))
            .await
    }
}
