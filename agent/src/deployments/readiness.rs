//! Device readiness
//!
//! Derives, for every device of a study deployment, whether it is registered,
//! whether it can retrieve its deployment, and whether it can be deployed.
//! Everything here is a pure function of the protocol's dependency graph and
//! the registrations received so far; nothing in this module fails.
//!
//! For a primary device `P`:
//!
//! - `connected(P)` are the devices connected to `P`, directly or through
//!   other connected devices;
//! - `depends_on(P)` are the other primary devices hosting the source of a
//!   trigger that controls a task on `P` or on one of `connected(P)`.
//!
//! `P` can obtain its deployment once `P` and the required devices of
//! `depends_on(P)` are registered, and can be deployed once the required
//! devices of `connected(P)` are registered as well.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::device::DeviceConfiguration;
use crate::models::protocol::StudyProtocolSnapshot;
use crate::models::status::{DeviceDeploymentStatus, DeviceReadiness};

/// Which registration changes invalidate a deployed primary device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeploymentPolicy {
    /// Any device included in the device's deployment, optional ones included
    #[default]
    AnyIncludedDevice,

    /// Only devices the device cannot be deployed without
    RequiredDevicesOnly,
}

/// Device dependencies of a protocol
#[derive(Debug, Clone, Copy)]
pub struct DependencyGraph<'a> {
    protocol: &'a StudyProtocolSnapshot,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(protocol: &'a StudyProtocolSnapshot) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &'a StudyProtocolSnapshot {
        self.protocol
    }

    /// Devices connected to `primary`, transitively, in declaration order
    pub fn connected_devices(&self, primary: &str) -> Vec<&'a DeviceConfiguration> {
        self.protocol
            .connected_devices
            .iter()
            .filter(|d| self.protocol.primary_of(&d.role_name) == Some(primary))
            .collect()
    }

    /// Other primary devices `primary` depends on through triggers
    pub fn primary_dependencies(&self, primary: &str) -> Vec<&'a DeviceConfiguration> {
        let sources: BTreeSet<&str> = self
            .protocol
            .task_controls
            .iter()
            .filter(|c| self.protocol.primary_of(&c.destination_device_role_name) == Some(primary))
            .filter_map(|c| self.protocol.triggers.get(&c.trigger_id))
            .filter_map(|t| self.protocol.primary_of(&t.source_device_role_name))
            .filter(|source| *source != primary)
            .collect();

        self.protocol
            .primary_devices
            .iter()
            .filter(|d| sources.contains(d.role_name.as_str()))
            .collect()
    }

    /// Devices whose registration is part of the deployment of `primary`
    pub fn included_devices(&self, primary: &str, policy: RedeploymentPolicy) -> BTreeSet<String> {
        self.connected_devices(primary)
            .into_iter()
            .chain(self.primary_dependencies(primary))
            .filter(|d| policy == RedeploymentPolicy::AnyIncludedDevice || !d.is_optional)
            .map(|d| d.role_name.clone())
            .collect()
    }

    /// Primary devices other than `role_name` whose deployment includes `role_name`
    pub fn dependents_of(&self, role_name: &str, policy: RedeploymentPolicy) -> BTreeSet<String> {
        self.protocol
            .primary_devices
            .iter()
            .filter(|p| p.role_name != role_name)
            .filter(|p| self.included_devices(&p.role_name, policy).contains(role_name))
            .map(|p| p.role_name.clone())
            .collect()
    }
}

/// Registration state a study deployment feeds into the readiness computation
#[derive(Debug, Clone, Copy)]
pub struct RegistrationState<'a> {
    pub registered: &'a BTreeSet<String>,
    pub deployed: &'a BTreeSet<String>,
    pub invalidated: &'a BTreeSet<String>,
}

impl RegistrationState<'_> {
    fn unregistered<'d>(
        &self,
        devices: impl IntoIterator<Item = &'d DeviceConfiguration>,
    ) -> BTreeSet<String> {
        devices
            .into_iter()
            .filter(|d| !d.is_optional && !self.registered.contains(&d.role_name))
            .map(|d| d.role_name.clone())
            .collect()
    }
}

/// Status of `device` given the current registrations
pub fn device_status(
    graph: &DependencyGraph<'_>,
    state: &RegistrationState<'_>,
    device: &DeviceConfiguration,
) -> DeviceDeploymentStatus {
    let role = device.role_name.as_str();
    let is_primary = graph.protocol().is_primary_device(role);

    let readiness = if is_primary {
        let to_obtain = state.unregistered(graph.primary_dependencies(role));
        let mut before_deployment = state.unregistered(graph.connected_devices(role));
        before_deployment.extend(to_obtain.iter().cloned());
        DeviceReadiness {
            requires_deployment: true,
            remaining_devices_to_register_to_obtain_deployment: to_obtain,
            remaining_devices_to_register_before_deployment: before_deployment,
        }
    } else {
        DeviceReadiness {
            requires_deployment: false,
            remaining_devices_to_register_to_obtain_deployment: BTreeSet::new(),
            remaining_devices_to_register_before_deployment: BTreeSet::new(),
        }
    };

    let device = device.clone();
    if state.invalidated.contains(role) {
        DeviceDeploymentStatus::NeedsRedeployment { device, readiness }
    } else if state.deployed.contains(role) {
        DeviceDeploymentStatus::Deployed { device }
    } else if state.registered.contains(role) {
        DeviceDeploymentStatus::Registered { device, readiness }
    } else {
        DeviceDeploymentStatus::Unregistered { device, readiness }
    }
}

/// Status of every device in the protocol, primary devices first
pub fn device_status_list(
    graph: &DependencyGraph<'_>,
    state: &RegistrationState<'_>,
) -> Vec<DeviceDeploymentStatus> {
    graph
        .protocol()
        .devices()
        .map(|device| device_status(graph, state, device))
        .collect()
}

/// Whether every non-optional device is deployed, or registered when it does
/// not need a deployment of its own
pub fn all_required_devices_deployed(statuses: &[DeviceDeploymentStatus]) -> bool {
    statuses
        .iter()
        .filter(|s| !s.device().is_optional)
        .all(|s| match s {
            DeviceDeploymentStatus::Deployed { .. } => true,
            DeviceDeploymentStatus::Registered { readiness, .. } => !readiness.requires_deployment,
            DeviceDeploymentStatus::Unregistered { .. }
            | DeviceDeploymentStatus::NeedsRedeployment { .. } => false,
        })
}
