//! Study Agent Library
//!
//! Coordinates the deployment of study protocols across participant devices:
//! the deployment host tracks registrations and readiness of every device,
//! and device agents retrieve, validate and confirm their part of a study.

pub mod app;
pub mod client;
pub mod deployments;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod participants;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
