//! Deployment host: study deployments, device readiness and the service
//! devices talk to

pub mod events;
pub mod readiness;
pub mod repository;
pub mod service;
pub mod study_deployment;
