pub mod chain;
pub mod registry;
pub mod service;

/// Cursor and health key of this service.
pub const SERVICE_NAME: &str = "node-registry";
