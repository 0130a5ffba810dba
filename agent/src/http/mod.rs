//! Talking to the deployment host

pub mod client;
pub mod deployments;
