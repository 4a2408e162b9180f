//! On-chain reads and writes of the settlement flow.

use std::future::Future;
use std::str::FromStr;

use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, RootProvider};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use anyhow::{Context, Result};
use market_framework::contracts::{JobManager, NodeReputation};
use market_framework::evm::EvmLogClient;

/// Outcome of one mined `incrementJobs` transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub success: bool,
    /// Job count reported by the contract's `JobCountIncremented` event.
    pub new_job_count: Option<u64>,
}

/// Read side of the payment chain.
pub trait JobLedger: Clone + Send + Sync + 'static {
    /// Provider the job was escrowed for. The zero address means the job is
    /// unknown to the contract.
    fn job_provider(&self, job_id: B256) -> impl Future<Output = Result<Address>> + Send;
}

/// The reputation chain's job counter.
pub trait ReputationLedger: Clone + Send + Sync + 'static {
    /// Submits `incrementJobs(provider)` and waits for it to be mined.
    fn increment_jobs(
        &self,
        provider: Address,
    ) -> impl Future<Output = Result<SettlementReceipt>> + Send;

    fn jobs_completed(&self, provider: Address) -> impl Future<Output = Result<u64>> + Send;
}

#[derive(Clone)]
pub struct JobManagerLedger {
    contract: JobManager::JobManagerInstance<RootProvider<Ethereum>>,
}

impl JobManagerLedger {
    /// Shares the log client's connection to the payment chain.
    pub fn new(client: &EvmLogClient) -> Self {
        Self {
            contract: JobManager::new(client.contract, client.provider.clone()),
        }
    }
}

impl JobLedger for JobManagerLedger {
    async fn job_provider(&self, job_id: B256) -> Result<Address> {
        let job = self
            .contract
            .getJobInfo(job_id)
            .call()
            .await
            .with_context(|| format!("getJobInfo({job_id}) failed"))?;
        Ok(job.provider)
    }
}

#[derive(Clone)]
pub struct NodeReputationLedger {
    contract: NodeReputation::NodeReputationInstance<DynProvider>,
}

impl NodeReputationLedger {
    /// Connects a signing provider for `private_key` to the reputation chain.
    pub fn new(rpc_url: &str, contract: Address, private_key: &str) -> Result<Self> {
        let signer =
            PrivateKeySigner::from_str(private_key).context("Failed to parse the admin private key")?;
        let url: Url = rpc_url
            .parse()
            .with_context(|| format!("Failed to parse RPC URL {rpc_url}"))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        Ok(Self {
            contract: NodeReputation::new(contract, provider),
        })
    }
}

impl ReputationLedger for NodeReputationLedger {
    async fn increment_jobs(&self, provider: Address) -> Result<SettlementReceipt> {
        let pending = self
            .contract
            .incrementJobs(provider)
            .send()
            .await
            .with_context(|| format!("Failed to submit incrementJobs({provider})"))?;
        let receipt = pending
            .get_receipt()
            .await
            .with_context(|| format!("Failed to get receipt of incrementJobs({provider})"))?;

        let contract = *self.contract.address();
        let new_job_count = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.address() == contract)
            .filter_map(|log| NodeReputation::JobCountIncremented::decode_log(&log.inner).ok())
            .find(|decoded| decoded.data.provider == provider)
            .map(|decoded| u64::try_from(decoded.data.newCount).unwrap_or(u64::MAX));

        Ok(SettlementReceipt {
            tx_hash: receipt.transaction_hash.to_string(),
            block_number: receipt.block_number,
            success: receipt.status(),
            new_job_count,
        })
    }

    async fn jobs_completed(&self, provider: Address) -> Result<u64> {
        let info = self
            .contract
            .getProviderInfo(provider)
            .call()
            .await
            .with_context(|| format!("getProviderInfo({provider}) failed"))?;
        Ok(u64::try_from(info.jobCount).unwrap_or(u64::MAX))
    }
}
