pub mod auth;
pub mod message;
pub mod orchestrator;
pub mod persistence;
