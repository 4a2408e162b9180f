use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use anyhow::{Result, bail};
use chrono::Utc;
use market_framework::bus::MemoryBus;
use market_framework::chain::EventSource;
use market_framework::error::QueryError;
use market_framework::model::ProviderRegistration;
use market_framework::query::{QueryClient, serve_queries};
use market_framework::shutdown;
use market_framework::store::{MemoryStore, ProviderStore};
use market_framework::sync::{EventSynchronizer, PollOutcome, SyncConfig};
use reputation_settler::chain::{ConfirmationEvent, JobConfirmedEvent};
use reputation_settler::engine::SettlementEngine;
use reputation_settler::ledger::{JobLedger, ReputationLedger, SettlementReceipt};
use reputation_settler::service::{
    REPUTATION_QUERY_SUBJECT, ReputationQuery, ReputationReply, ReputationRequest,
};

#[derive(Clone, Default)]
struct Chains {
    head: Arc<Mutex<u64>>,
    confirmations: Arc<Mutex<Vec<JobConfirmedEvent>>>,
    escrows: Arc<Mutex<HashMap<B256, Address>>>,
    counts: Arc<Mutex<HashMap<Address, u64>>>,
}

impl Chains {
    fn confirm(&self, block: u64, job_id: B256, provider: Address) {
        self.escrows.lock().unwrap().insert(job_id, provider);
        let mut head = self.head.lock().unwrap();
        *head = (*head).max(block);
        self.confirmations.lock().unwrap().push(JobConfirmedEvent {
            job_id,
            confirmed_at: 1_717_000_000 + block,
            block_number: block,
            transaction_hash: format!("0xconfirm{block}"),
        });
    }
}

impl EventSource for Chains {
    type Kind = ConfirmationEvent;
    type Event = JobConfirmedEvent;

    async fn latest_block(&self) -> Result<u64> {
        Ok(*self.head.lock().unwrap())
    }

    async fn fetch_events(
        &self,
        _kind: ConfirmationEvent,
        from: u64,
        to: u64,
    ) -> Result<Vec<JobConfirmedEvent>> {
        Ok(self
            .confirmations
            .lock()
            .unwrap()
            .iter()
            .filter(|event| (from..=to).contains(&event.block_number))
            .cloned()
            .collect())
    }
}

impl JobLedger for Chains {
    async fn job_provider(&self, job_id: B256) -> Result<Address> {
        Ok(self
            .escrows
            .lock()
            .unwrap()
            .get(&job_id)
            .copied()
            .unwrap_or(Address::ZERO))
    }
}

impl ReputationLedger for Chains {
    async fn increment_jobs(&self, provider: Address) -> Result<SettlementReceipt> {
        if provider == Address::repeat_byte(0xde) {
            bail!("nonce too low");
        }
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(provider).or_default();
        *count += 1;
        Ok(SettlementReceipt {
            tx_hash: format!("0xinc{count}"),
            block_number: Some(1),
            success: true,
            // Exercise the read-back path.
            new_job_count: None,
        })
    }

    async fn jobs_completed(&self, provider: Address) -> Result<u64> {
        Ok(self.counts.lock().unwrap().get(&provider).copied().unwrap_or(0))
    }
}

#[tokio::test]
async fn confirmations_are_credited_and_queryable() {
    let chains = Chains::default();
    let store = MemoryStore::new();
    let bus = MemoryBus::new();
    let provider = Address::repeat_byte(0xaa);
    store
        .upsert_provider(
            &ProviderRegistration {
                wallet_address: provider.to_checksum(None),
                gpu_model: "RTX 4090".into(),
                vram: 24,
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let engine = SettlementEngine::new(chains.clone(), chains.clone(), store.clone());
    let mut sync = EventSynchronizer::new(
        chains.clone(),
        engine.clone(),
        store.clone(),
        vec![ConfirmationEvent::JobConfirmed],
        SyncConfig {
            service: "reputation-settler".into(),
            poll_interval: Duration::from_secs(10),
            range_size: 2,
            start_block: Some(1),
        },
    );

    chains.confirm(2, B256::repeat_byte(1), provider);
    chains.confirm(3, B256::repeat_byte(2), provider);
    chains.confirm(4, B256::repeat_byte(3), Address::repeat_byte(0xde));
    chains.confirm(5, B256::repeat_byte(4), provider);

    let outcome = sync.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Advanced {
            from: 1,
            to: 5,
            events: 4,
            failed: 1
        }
    );

    let row = store
        .get_provider(&provider.to_checksum(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.reputation_score, 3);
    assert_eq!(row.total_jobs_completed, 3);

    let (trigger, stop) = shutdown::channel();
    let responder = tokio::spawn(serve_queries(
        bus.clone(),
        REPUTATION_QUERY_SUBJECT.to_string(),
        ReputationQuery(engine),
        stop,
    ));
    tokio::task::yield_now().await;

    let client = QueryClient::new(bus.clone()).with_timeout(Duration::from_millis(200));
    let reply: ReputationReply = client
        .request(
            REPUTATION_QUERY_SUBJECT,
            &ReputationRequest {
                provider_address: provider.to_string().to_lowercase(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.provider_address, provider.to_checksum(None));
    assert_eq!(reply.jobs_completed, 3);
    assert_eq!(reply.reputation_score, 3);

    let malformed = client
        .request::<_, ReputationReply>(
            REPUTATION_QUERY_SUBJECT,
            &ReputationRequest {
                provider_address: "not-an-address".into(),
            },
        )
        .await;
    assert!(matches!(malformed, Err(QueryError::Internal)));

    trigger.trigger();
    responder.await.unwrap().unwrap();
}
