use alloy::hex::ToHexExt;
use alloy::primitives::B256;
use alloy::rpc::types::eth::Log;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use market_framework::chain::EventSource;
use market_framework::contracts::JobManager;
use market_framework::evm::{EvmLogClient, log_position};

/// A renter confirmed completion of an escrowed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfirmedEvent {
    pub job_id: B256,
    pub confirmed_at: u64,
    pub block_number: u64,
    pub transaction_hash: String,
}

impl JobConfirmedEvent {
    pub fn job_id_hex(&self) -> String {
        self.job_id.encode_hex_with_prefix()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationEvent {
    JobConfirmed,
}

/// `JobConfirmed` logs of the payment chain's `JobManager`.
#[derive(Clone)]
pub struct ConfirmationSource {
    client: EvmLogClient,
}

impl ConfirmationSource {
    pub fn new(client: EvmLogClient) -> Self {
        Self { client }
    }
}

pub fn decode_job_confirmed(log: &Log) -> Result<JobConfirmedEvent> {
    let (block_number, transaction_hash) = log_position(log);
    let decoded = JobManager::JobConfirmed::decode_log(&log.inner)
        .with_context(|| format!("Failed to ABI decode JobConfirmed in tx {transaction_hash}"))?
        .data;

    Ok(JobConfirmedEvent {
        job_id: decoded.jobId,
        confirmed_at: u64::try_from(decoded.confirmedAt).unwrap_or(u64::MAX),
        block_number,
        transaction_hash,
    })
}

impl EventSource for ConfirmationSource {
    type Kind = ConfirmationEvent;
    type Event = JobConfirmedEvent;

    async fn latest_block(&self) -> Result<u64> {
        self.client.latest_block().await
    }

    async fn fetch_events(
        &self,
        kind: ConfirmationEvent,
        from: u64,
        to: u64,
    ) -> Result<Vec<JobConfirmedEvent>> {
        match kind {
            ConfirmationEvent::JobConfirmed => self
                .client
                .logs(JobManager::JobConfirmed::SIGNATURE, from, to)
                .await?
                .iter()
                .map(decode_job_confirmed)
                .collect(),
        }
    }
}
