//! Device side of study deployments

pub mod capability;
pub mod manager;
pub mod repository;
pub mod study;
