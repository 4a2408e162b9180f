use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::Result;
use chrono::Utc;
use market_framework::SaturatingConvert;
use market_framework::chain::EventHandler;
use market_framework::error::HandleError;
use market_framework::store::ProviderStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::chain::JobConfirmedEvent;
use crate::ledger::{JobLedger, ReputationLedger, SettlementReceipt};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("failed to resolve provider of job {job_id}")]
    Resolve {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("job {0} is unknown to the payment contract")]
    UnknownJob(String),

    #[error("failed to increment jobs of {provider} for job {job_id}")]
    Submit {
        job_id: String,
        provider: Address,
        #[source]
        source: anyhow::Error,
    },

    #[error("incrementJobs for job {job_id} reverted in tx {tx_hash}")]
    Reverted { job_id: String, tx_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub job_id: String,
    pub provider: Address,
    pub receipt: SettlementReceipt,
}

/// Credits providers on the reputation chain for jobs confirmed on the
/// payment chain.
///
/// Submissions share one signing key, so they go through `submit_lock` one
/// at a time: a second settlement acquires its nonce only after the previous
/// transaction is mined. Each confirmation is credited at most once per
/// observation; failures are reported, never retried.
#[derive(Clone)]
pub struct SettlementEngine<J, R, S> {
    jobs: J,
    reputation: R,
    store: S,
    submit_lock: Arc<Mutex<()>>,
}

impl<J, R, S> SettlementEngine<J, R, S>
where
    J: JobLedger,
    R: ReputationLedger,
    S: ProviderStore,
{
    pub fn new(jobs: J, reputation: R, store: S) -> Self {
        Self {
            jobs,
            reputation,
            store,
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    #[instrument(level = "info", skip_all, fields(job_id = %event.job_id_hex(), block = event.block_number))]
    pub async fn settle(&self, event: &JobConfirmedEvent) -> Result<Settlement, SettlementError> {
        let job_id = event.job_id_hex();

        let provider = self
            .jobs
            .job_provider(event.job_id)
            .await
            .map_err(|source| SettlementError::Resolve {
                job_id: job_id.clone(),
                source,
            })?;
        if provider == Address::ZERO {
            return Err(SettlementError::UnknownJob(job_id));
        }

        let receipt = {
            let _guard = self.submit_lock.lock().await;
            self.reputation
                .increment_jobs(provider)
                .await
                .map_err(|source| SettlementError::Submit {
                    job_id: job_id.clone(),
                    provider,
                    source,
                })?
        };

        if !receipt.success {
            return Err(SettlementError::Reverted {
                job_id,
                tx_hash: receipt.tx_hash,
            });
        }

        info!(
            %provider,
            tx_hash = %receipt.tx_hash,
            mined_in = ?receipt.block_number,
            job_count = ?receipt.new_job_count,
            "Incremented provider job count"
        );

        self.mirror(provider, receipt.new_job_count).await;

        Ok(Settlement {
            job_id,
            provider,
            receipt,
        })
    }

    /// Copies the chain's count into the provider row. Failures only warn,
    /// the chain stays the source of truth.
    async fn mirror(&self, provider: Address, reported: Option<u64>) {
        let job_count = match reported {
            Some(count) => count,
            None => match self.reputation.jobs_completed(provider).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(%provider, error = ?err, "Failed to read job count, skipping mirror");
                    return;
                }
            },
        };

        let wallet = provider.to_checksum(None);
        match self
            .store
            .record_settlement(&wallet, job_count.saturating_to(), Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(provider = %wallet, "Settled provider has no registry row"),
            Err(err) => warn!(provider = %wallet, error = ?err, "Failed to mirror settlement"),
        }
    }

    pub async fn reputation_score(&self, provider: Address) -> Result<u64> {
        self.reputation.jobs_completed(provider).await
    }

    pub async fn jobs_completed(&self, provider: Address) -> Result<u64> {
        self.reputation.jobs_completed(provider).await
    }
}

impl<J, R, S> EventHandler<JobConfirmedEvent> for SettlementEngine<J, R, S>
where
    J: JobLedger,
    R: ReputationLedger,
    S: ProviderStore,
{
    /// Never asks for a retry: replaying the window would credit the
    /// confirmations before this one a second time.
    async fn handle(&self, event: &JobConfirmedEvent) -> Result<(), HandleError> {
        self.settle(event)
            .await
            .map_err(|err| HandleError::Skip(err.into()))?;
        Ok(())
    }
}
