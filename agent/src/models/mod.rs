//! Domain models shared by the deployment host and the device agent

pub mod deployment;
pub mod device;
pub mod protocol;
pub mod status;
