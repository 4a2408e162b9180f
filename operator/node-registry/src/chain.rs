use alloy::primitives::U256;
use alloy::rpc::types::eth::Log;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use market_framework::chain::EventSource;
use market_framework::contracts::NodeReputation;
use market_framework::evm::{EvmLogClient, log_position};
use market_framework::model::ProviderRegistration;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRegisteredEvent {
    pub wallet_address: String,
    pub gpu_model: String,
    pub vram: i64,
    pub block_number: u64,
    pub transaction_hash: String,
}

impl NodeRegisteredEvent {
    pub fn registration(&self) -> ProviderRegistration {
        ProviderRegistration {
            wallet_address: self.wallet_address.clone(),
            gpu_model: self.gpu_model.clone(),
            vram: self.vram,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeHeartbeatEvent {
    pub wallet_address: String,
    /// Chain-reported timestamp, kept for logging. Liveness uses local time.
    pub timestamp: u64,
    pub block_number: u64,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(NodeRegisteredEvent),
    Heartbeat(NodeHeartbeatEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    NodeRegistered,
    NodeHeartbeat,
}

/// `NodeReputation` logs on the reputation chain.
#[derive(Clone)]
pub struct ReputationChainSource {
    client: EvmLogClient,
}

impl ReputationChainSource {
    pub fn new(client: EvmLogClient) -> Self {
        Self { client }
    }
}

fn saturate(value: U256) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn decode_node_registered(log: &Log) -> Result<NodeRegisteredEvent> {
    let (block_number, transaction_hash) = log_position(log);
    let decoded = NodeReputation::NodeRegistered::decode_log(&log.inner)
        .with_context(|| format!("Failed to ABI decode NodeRegistered in tx {transaction_hash}"))?
        .data;

    Ok(NodeRegisteredEvent {
        wallet_address: decoded.provider.to_checksum(None),
        gpu_model: decoded.gpuModel,
        vram: saturate(decoded.vram),
        block_number,
        transaction_hash,
    })
}

pub fn decode_node_heartbeat(log: &Log) -> Result<NodeHeartbeatEvent> {
    let (block_number, transaction_hash) = log_position(log);
    let decoded = NodeReputation::NodeHeartbeat::decode_log(&log.inner)
        .with_context(|| format!("Failed to ABI decode NodeHeartbeat in tx {transaction_hash}"))?
        .data;

    Ok(NodeHeartbeatEvent {
        wallet_address: decoded.provider.to_checksum(None),
        timestamp: u64::try_from(decoded.timestamp).unwrap_or(u64::MAX),
        block_number,
        transaction_hash,
    })
}

impl EventSource for ReputationChainSource {
    type Kind = RegistryEventKind;
    type Event = RegistryEvent;

    async fn latest_block(&self) -> Result<u64> {
        self.client.latest_block().await
    }

    async fn fetch_events(
        &self,
        kind: RegistryEventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RegistryEvent>> {
        match kind {
            RegistryEventKind::NodeRegistered => self
                .client
                .logs(NodeReputation::NodeRegistered::SIGNATURE, from, to)
                .await?
                .iter()
                .map(|log| decode_node_registered(log).map(RegistryEvent::Registered))
                .collect(),
            RegistryEventKind::NodeHeartbeat => self
                .client
                .logs(NodeReputation::NodeHeartbeat::SIGNATURE, from, to)
                .await?
                .iter()
                .map(|log| decode_node_heartbeat(log).map(RegistryEvent::Heartbeat))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, Log as PrimitiveLog};

    use super::*;

    fn rpc_log(data: alloy::primitives::LogData, block: u64) -> Log {
        Log {
            inner: PrimitiveLog {
                address: Address::ZERO,
                data,
            },
            block_number: Some(block),
            transaction_hash: Some(B256::repeat_byte(0x42)),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_node_registered() {
        let provider = Address::repeat_byte(0xab);
        let event = NodeReputation::NodeRegistered {
            provider,
            gpuModel: "RTX 4090".into(),
            vram: U256::from(24u64),
        };

        let decoded = decode_node_registered(&rpc_log(event.encode_log_data(), 7)).unwrap();
        assert_eq!(decoded.wallet_address, provider.to_checksum(None));
        assert_eq!(decoded.gpu_model, "RTX 4090");
        assert_eq!(decoded.vram, 24);
        assert_eq!(decoded.block_number, 7);
    }

    #[test]
    fn test_oversized_vram_saturates() {
        let event = NodeReputation::NodeRegistered {
            provider: Address::repeat_byte(0x01),
            gpuModel: "H100".into(),
            vram: U256::MAX,
        };

        let decoded = decode_node_registered(&rpc_log(event.encode_log_data(), 1)).unwrap();
        assert_eq!(decoded.vram, i64::MAX);
    }

    #[test]
    fn test_decode_node_heartbeat() {
        let event = NodeReputation::NodeHeartbeat {
            provider: Address::repeat_byte(0x02),
            timestamp: U256::from(1_717_000_000u64),
        };
        let heartbeat = decode_node_heartbeat(&rpc_log(event.encode_log_data(), 3)).unwrap();
        assert_eq!(heartbeat.wallet_address, Address::repeat_byte(0x02).to_checksum(None));
        assert_eq!(heartbeat.timestamp, 1_717_000_000);
    }
}
