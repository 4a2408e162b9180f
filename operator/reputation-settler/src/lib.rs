pub mod chain;
pub mod engine;
pub mod ledger;
pub mod service;

/// Cursor and health key of this service.
pub const SERVICE_NAME: &str = "reputation-settler";
