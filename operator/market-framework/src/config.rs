//! Command line options shared by the service binaries. Every option can
//! also be set from the environment or a `.env` file.

use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use clap::Args;

use crate::health::{HealthConfig, HealthTracker, spawn_health_server};
use crate::sync::SyncConfig;

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,
}

#[derive(Args, Debug, Clone)]
pub struct BusArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Seconds between chain polling passes
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "10")]
    pub poll_interval_secs: u64,

    /// Size of block range for fetching logs
    #[arg(long, env = "RANGE_SIZE", default_value = "500")]
    pub range_size: u64,

    /// First block to scan; ignored when behind the persisted cursor
    #[arg(long, env = "START_BLOCK")]
    pub start_block: Option<u64>,
}

impl SyncArgs {
    pub fn sync_config(&self, service: &str) -> SyncConfig {
        SyncConfig {
            service: service.to_string(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            range_size: self.range_size,
            start_block: self.start_block,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct HealthArgs {
    /// Health check port
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,
}

impl HealthArgs {
    /// Creates the service's tracker and serves it on the health port.
    pub fn serve(&self, service: &str, range_size: u64) -> HealthTracker {
        let health = HealthTracker::new(service, HealthConfig::for_range(range_size));
        spawn_health_server(health.clone(), self.health_port);
        health
    }
}

pub fn parse_address(value: &str, what: &str) -> Result<Address> {
    value
        .parse()
        .with_context(|| format!("Failed to parse {what} '{value}' into an ethereum address"))
}
