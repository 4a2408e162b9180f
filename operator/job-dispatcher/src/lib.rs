pub mod chain;
pub mod engine;
pub mod service;

/// Cursor and health key of this service.
pub const SERVICE_NAME: &str = "job-dispatcher";
