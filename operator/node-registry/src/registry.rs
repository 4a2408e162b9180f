use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use market_framework::chain::EventHandler;
use market_framework::error::{HandleError, StoreError};
use market_framework::health::HealthTracker;
use market_framework::model::Provider;
use market_framework::query::{NodeFilter, NodesResponse};
use market_framework::shutdown::Shutdown;
use market_framework::store::ProviderStore;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{NodeHeartbeatEvent, NodeRegisteredEvent, RegistryEvent};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LIVENESS_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("failed to register provider {wallet}")]
    Register {
        wallet: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to record heartbeat of provider {wallet}")]
    Heartbeat {
        wallet: String,
        #[source]
        source: StoreError,
    },

    #[error("offline sweep failed")]
    Sweep(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LivenessError {
    fn into_store_error(self) -> StoreError {
        match self {
            LivenessError::Register { source, .. } | LivenessError::Heartbeat { source, .. } => source,
            LivenessError::Sweep(source) | LivenessError::Store(source) => source,
        }
    }
}

/// Tracks which providers are reachable: registrations and heartbeats mark a
/// provider online, the periodic sweep is the only way back to offline.
#[derive(Clone)]
pub struct LivenessRegistry<S> {
    store: S,
    threshold: TimeDelta,
}

impl<S: ProviderStore> LivenessRegistry<S> {
    pub fn new(store: S, threshold: Duration) -> Self {
        Self {
            store,
            threshold: TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX),
        }
    }

    pub async fn on_node_registered(
        &self,
        event: &NodeRegisteredEvent,
    ) -> Result<Provider, LivenessError> {
        let provider = self
            .store
            .upsert_provider(&event.registration(), Utc::now())
            .await
            .map_err(|source| LivenessError::Register {
                wallet: event.wallet_address.clone(),
                source,
            })?;

        info!(
            provider = %provider.wallet_address,
            gpu_model = %provider.gpu_model,
            vram = provider.vram,
            block = event.block_number,
            "Provider registered"
        );
        Ok(provider)
    }

    /// Returns whether the provider was known. Heartbeats from unregistered
    /// wallets are ignored.
    pub async fn on_heartbeat(&self, event: &NodeHeartbeatEvent) -> Result<bool, LivenessError> {
        let known = self
            .store
            .touch_provider(&event.wallet_address, Utc::now())
            .await
            .map_err(|source| LivenessError::Heartbeat {
                wallet: event.wallet_address.clone(),
                source,
            })?;

        if known {
            debug!(provider = %event.wallet_address, chain_timestamp = event.timestamp, "Heartbeat");
        } else {
            warn!(
                provider = %event.wallet_address,
                block = event.block_number,
                tx_hash = %event.transaction_hash,
                "Heartbeat from unregistered provider, ignoring"
            );
        }
        Ok(known)
    }

    /// Marks offline every online provider not seen since `now - threshold`.
    pub async fn sweep_offline(&self, now: DateTime<Utc>) -> Result<u64, LivenessError> {
        let Some(cutoff) = now.checked_sub_signed(self.threshold) else {
            return Ok(0);
        };

        let flipped = self
            .store
            .mark_offline_before(cutoff)
            .await
            .map_err(LivenessError::Sweep)?;
        if flipped > 0 {
            info!(count = flipped, %cutoff, "Marked stale providers offline");
        }
        Ok(flipped)
    }

    pub async fn list_active_nodes(&self, filter: &NodeFilter) -> Result<NodesResponse, LivenessError> {
        Ok(self.store.list_active_providers(filter).await?.into())
    }

    /// Sweeps on a fixed interval until shutdown, independent of chain polling.
    /// Failed sweeps count as errors on the service's health report.
    #[instrument(level = "info", skip_all, parent = None, fields(every = ?every))]
    pub async fn run_sweeper(
        self,
        every: Duration,
        health: HealthTracker,
        mut shutdown: Shutdown,
    ) -> Result<()> {
        if every.is_zero() {
            bail!("Sweep interval must be positive");
        }

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.sweep_offline(Utc::now()).await {
                error!(error = ?err, "Offline sweep failed, retrying next tick");
                health.record_error(format!("{err:#}"));
            }
        }

        info!("Sweeper stopped");
        Ok(())
    }
}

impl<S: ProviderStore> EventHandler<RegistryEvent> for LivenessRegistry<S> {
    /// Registrations and heartbeats are idempotent, so a store outage asks
    /// for the window to be replayed.
    async fn handle(&self, event: &RegistryEvent) -> Result<(), HandleError> {
        let handled = match event {
            RegistryEvent::Registered(registered) => {
                self.on_node_registered(registered).await.map(|_| ())
            }
            RegistryEvent::Heartbeat(heartbeat) => self.on_heartbeat(heartbeat).await.map(|_| ()),
        };
        handled.map_err(|err| HandleError::from_store(err.into_store_error()))
    }
}
