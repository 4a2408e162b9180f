use alloy::hex::ToHexExt;
use alloy::rpc::types::eth::Log;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use market_framework::chain::EventSource;
use market_framework::contracts::JobManager;
use market_framework::evm::{EvmLogClient, log_position};
use market_framework::model::NewJob;

/// A job escrowed on the payment chain.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCreatedEvent {
    pub job_id: String,
    pub renter_address: String,
    pub provider_address: String,
    pub docker_image: String,
    pub input_file_cid: String,
    pub payment_amount: String,
    pub block_number: u64,
    pub transaction_hash: String,
}

impl JobCreatedEvent {
    pub fn new_job(&self) -> NewJob {
        NewJob {
            id: self.job_id.clone(),
            renter_address: self.renter_address.clone(),
            provider_address: self.provider_address.clone(),
            docker_image: self.docker_image.clone(),
            input_file_cid: self.input_file_cid.clone(),
            payment_amount: self.payment_amount.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    JobCreated,
}

/// `JobManager` logs on the payment chain.
#[derive(Clone)]
pub struct PaymentChainSource {
    client: EvmLogClient,
}

impl PaymentChainSource {
    pub fn new(client: EvmLogClient) -> Self {
        Self { client }
    }
}

pub fn decode_job_created(log: &Log) -> Result<JobCreatedEvent> {
    let (block_number, transaction_hash) = log_position(log);
    let decoded = JobManager::JobCreated::decode_log(&log.inner)
        .with_context(|| format!("Failed to ABI decode JobCreated in tx {transaction_hash}"))?
        .data;

    Ok(JobCreatedEvent {
        job_id: decoded.jobId.encode_hex_with_prefix(),
        renter_address: decoded.renter.to_checksum(None),
        provider_address: decoded.provider.to_checksum(None),
        docker_image: decoded.dockerImage,
        input_file_cid: decoded.inputFileCID,
        payment_amount: decoded.payment.to_string(),
        block_number,
        transaction_hash,
    })
}

impl EventSource for PaymentChainSource {
    type Kind = PaymentEvent;
    type Event = JobCreatedEvent;

    async fn latest_block(&self) -> Result<u64> {
        self.client.latest_block().await
    }

    async fn fetch_events(&self, kind: PaymentEvent, from: u64, to: u64) -> Result<Vec<JobCreatedEvent>> {
        match kind {
            PaymentEvent::JobCreated => self
                .client
                .logs(JobManager::JobCreated::SIGNATURE, from, to)
                .await?
                .iter()
                .map(decode_job_created)
                .collect(),
        }
    }
}
