use std::time::Duration;

use alloy::network::Ethereum;
use alloy::primitives::Address;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::Filter;
use alloy::rpc::types::eth::Log;
use alloy::transports::http::reqwest::Url;
use anyhow::{Context, Result};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::warn;

/// Read-only access to one contract's logs on an EVM endpoint.
#[derive(Clone, Debug)]
pub struct EvmLogClient {
    pub provider: RootProvider<Ethereum>,
    pub contract: Address,
}

impl EvmLogClient {
    pub fn new(rpc_url: &str, contract: Address) -> Result<Self> {
        let url: Url = rpc_url
            .parse()
            .with_context(|| format!("Failed to parse RPC URL {rpc_url}"))?;

        Ok(Self {
            provider: RootProvider::<Ethereum>::new_http(url),
            contract,
        })
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(500)
            .max_delay(Duration::from_secs(10))
            .take(3)
            .map(jitter)
    }

    pub async fn latest_block(&self) -> Result<u64> {
        Retry::spawn(Self::retry_strategy(), || async {
            self.provider.get_block_number().await.inspect_err(|err| {
                warn!(error = ?err, "Retrying get_block_number RPC call");
            })
        })
        .await
        .context("Failed to fetch the latest block number from the RPC")
    }

    /// Logs carrying `signature` as topic0, emitted by the contract within
    /// the inclusive range.
    pub async fn logs(&self, signature: &str, from: u64, to: u64) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .event(signature)
            .from_block(from)
            .to_block(to)
            .address(self.contract);

        Retry::spawn(Self::retry_strategy(), || async {
            self.provider.get_logs(&filter).await.inspect_err(|err| {
                warn!(from, to, signature, error = ?err, "Retrying get_logs RPC call");
            })
        })
        .await
        .with_context(|| format!("Failed to fetch {signature} logs for blocks ({from}, {to})"))
    }
}

/// Hash and block coordinates used in log lines.
pub fn log_position(log: &Log) -> (u64, String) {
    let block = log.block_number.unwrap_or_default();
    let tx_hash = log
        .transaction_hash
        .map(|hash| hash.to_string())
        .unwrap_or_default();
    (block, tx_hash)
}
