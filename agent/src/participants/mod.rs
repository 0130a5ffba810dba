//! Participants: accounts, participant groups and the data participants provide

pub mod accounts;
pub mod data;
pub mod group;
pub mod repository;
pub mod service;
