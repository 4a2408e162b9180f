use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use job_dispatcher::chain::{JobCreatedEvent, PaymentEvent};
use job_dispatcher::engine::DispatchEngine;
use job_dispatcher::service::{
    JobsQuery, REDISPATCH_SUBJECT, Redispatch, RedispatchReply, RedispatchRequest, STATUS_SUBJECT,
    consume_status_updates,
};
use market_framework::bus::{MemoryBus, MessageBus, publish_json};
use market_framework::chain::EventSource;
use market_framework::error::QueryError;
use market_framework::model::{JobAssignment, JobStatus, JobStatusUpdate, NewJob, StatusChange};
use market_framework::query::{JOBS_QUERY_SUBJECT, JobFilter, QueryClient, serve_queries};
use market_framework::shutdown;
use market_framework::store::{CursorStore, JobStore, MemoryStore};
use market_framework::sync::{EventSynchronizer, PollOutcome, SyncConfig};

#[derive(Default)]
struct ChainState {
    head: u64,
    events: Vec<JobCreatedEvent>,
    unreachable: bool,
}

#[derive(Clone, Default)]
struct FakePaymentChain(Arc<Mutex<ChainState>>);

impl FakePaymentChain {
    fn emit(&self, block: u64, job_id: &str, provider: &str) {
        let mut state = self.0.lock().unwrap();
        state.head = state.head.max(block);
        state.events.push(JobCreatedEvent {
            job_id: job_id.into(),
            renter_address: "0xRenter".into(),
            provider_address: provider.into(),
            docker_image: "img:1".into(),
            input_file_cid: "Qm1".into(),
            payment_amount: "1000000000000000000".into(),
            block_number: block,
            transaction_hash: format!("0xtx{block}"),
        });
    }
}

impl EventSource for FakePaymentChain {
    type Kind = PaymentEvent;
    type Event = JobCreatedEvent;

    async fn latest_block(&self) -> Result<u64> {
        let state = self.0.lock().unwrap();
        if state.unreachable {
            bail!("connection refused");
        }
        Ok(state.head)
    }

    async fn fetch_events(&self, _kind: PaymentEvent, from: u64, to: u64) -> Result<Vec<JobCreatedEvent>> {
        let state = self.0.lock().unwrap();
        if state.unreachable {
            bail!("connection refused");
        }
        Ok(state
            .events
            .iter()
            .filter(|event| (from..=to).contains(&event.block_number))
            .cloned()
            .collect())
    }
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        service: "job-dispatcher".into(),
        poll_interval: Duration::from_secs(10),
        range_size: 100,
        start_block: Some(1),
    }
}

#[tokio::test]
async fn job_created_on_chain_reaches_provider_and_is_assigned() {
    let chain = FakePaymentChain::default();
    let store = MemoryStore::new();
    let bus = MemoryBus::new();
    let mut provider_inbox = bus.subscribe("jobs.dispatch.0xP").await.unwrap();

    let engine = DispatchEngine::new(store.clone(), bus.clone());
    let mut sync = EventSynchronizer::new(
        chain.clone(),
        engine.clone(),
        store.clone(),
        vec![PaymentEvent::JobCreated],
        sync_config(),
    );

    chain.emit(5, "0xabc", "0xP");
    sync.poll_once().await.unwrap();

    let message = provider_inbox.next().await.unwrap();
    let assignment: JobAssignment = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(
        assignment,
        JobAssignment {
            job_id: "0xabc".into(),
            docker_image: "img:1".into(),
            input_file_cid: "Qm1".into(),
        }
    );

    let job = store.get_job("0xabc").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert!(job.assigned_at.is_some());
    assert_eq!(sync.cursor(), Some(5));
}

#[tokio::test]
async fn replayed_window_does_not_duplicate_jobs() {
    let chain = FakePaymentChain::default();
    let store = MemoryStore::new();
    let bus = MemoryBus::new();
    let engine = DispatchEngine::new(store.clone(), bus.clone());

    chain.emit(3, "0x01", "0xP");
    chain.emit(4, "0x02", "0xP");

    let mut first = EventSynchronizer::new(
        chain.clone(),
        engine.clone(),
        store.clone(),
        vec![PaymentEvent::JobCreated],
        sync_config(),
    );
    first.poll_once().await.unwrap();

    // A fresh process with an explicit start block rescans the same window.
    let replay_store = store.clone();
    let mut replay = EventSynchronizer::new(
        chain.clone(),
        engine,
        replay_store,
        vec![PaymentEvent::JobCreated],
        SyncConfig {
            service: "job-dispatcher-replay".into(),
            ..sync_config()
        },
    );
    let outcome = replay.poll_once().await.unwrap();

    assert_eq!(
        outcome,
        PollOutcome::Advanced {
            from: 1,
            to: 4,
            events: 2,
            failed: 2
        }
    );
    assert_eq!(store.list_jobs(&JobFilter::default()).await.unwrap().len(), 2);
    assert_eq!(bus.published_to("jobs.dispatch.0xP").len(), 2);
}

#[tokio::test]
async fn unreachable_chain_leaves_cursor_in_place() {
    let chain = FakePaymentChain::default();
    let store = MemoryStore::new();
    let engine = DispatchEngine::new(store.clone(), MemoryBus::new());
    let mut sync = EventSynchronizer::new(
        chain.clone(),
        engine,
        store.clone(),
        vec![PaymentEvent::JobCreated],
        sync_config(),
    );
    sync.initialize().await.unwrap();

    chain.emit(7, "0x07", "0xP");
    chain.0.lock().unwrap().unreachable = true;
    assert!(sync.poll_once().await.is_err());
    assert_eq!(sync.cursor(), Some(0));

    chain.0.lock().unwrap().unreachable = false;
    sync.poll_once().await.unwrap();
    assert_eq!(sync.cursor(), Some(7));
    assert!(store.get_job("0x07").await.unwrap().is_some());
}

#[tokio::test]
async fn store_outage_keeps_window_until_store_returns() {
    let chain = FakePaymentChain::default();
    let store = MemoryStore::new();
    let cursors = MemoryStore::new();
    let bus = MemoryBus::new();
    let engine = DispatchEngine::new(store.clone(), bus.clone());
    let mut sync = EventSynchronizer::new(
        chain.clone(),
        engine,
        cursors.clone(),
        vec![PaymentEvent::JobCreated],
        sync_config(),
    );

    chain.emit(5, "0xabc", "0xP");
    store.set_unavailable(true);
    assert!(sync.poll_once().await.is_err());
    assert_eq!(sync.cursor(), Some(0));
    assert_eq!(cursors.load_cursor("job-dispatcher").await.unwrap(), Some(0));
    assert!(bus.published_to("jobs.dispatch.0xP").is_empty());

    store.set_unavailable(false);
    let outcome = sync.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Advanced {
            from: 1,
            to: 5,
            events: 1,
            failed: 0
        }
    );
    let job = store.get_job("0xabc").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert_eq!(bus.published_to("jobs.dispatch.0xP").len(), 1);
}

#[tokio::test]
async fn jobs_query_returns_newest_failed_jobs() {
    let store = MemoryStore::new();
    let bus = MemoryBus::new();
    let start = Utc::now() - chrono::Duration::hours(1);

    for i in 0..15i64 {
        let id = format!("0x{i:02}");
        let created_at = start + chrono::Duration::seconds(i);
        store
            .insert_job(
                NewJob {
                    id: id.clone(),
                    renter_address: "0xRenter".into(),
                    provider_address: "0xP".into(),
                    docker_image: "img".into(),
                    input_file_cid: "cid".into(),
                    payment_amount: "1".into(),
                },
                created_at,
            )
            .await
            .unwrap();

        if i % 3 == 0 {
            // Leave every third job in `created`.
            continue;
        }
        for (from, to) in [
            (JobStatus::Created, JobStatus::Assigned),
            (JobStatus::Assigned, JobStatus::Running),
            (JobStatus::Running, JobStatus::Failed),
        ] {
            let change = StatusChange {
                status: to,
                at: created_at,
                output_file_cid: None,
                error_message: None,
            };
            store.transition_job(&id, from, &change).await.unwrap().unwrap();
        }
    }

    let (trigger, stop) = shutdown::channel();
    let engine = DispatchEngine::new(store.clone(), bus.clone());
    let responder = tokio::spawn(serve_queries(
        bus.clone(),
        JOBS_QUERY_SUBJECT.to_string(),
        JobsQuery(engine),
        stop,
    ));
    tokio::task::yield_now().await;

    let client = QueryClient::new(bus.clone());
    let filter = JobFilter {
        status: Some(JobStatus::Failed),
        limit: Some(10),
        ..Default::default()
    };
    let response = client.jobs(&filter).await.unwrap();

    assert_eq!(response.count, 10);
    assert!(response.jobs.iter().all(|job| job.status == JobStatus::Failed));
    assert!(
        response
            .jobs
            .windows(2)
            .all(|pair| pair[0].created_at >= pair[1].created_at)
    );
    assert_eq!(response.jobs[0].id, "0x14");

    store.set_unavailable(true);
    let client = client.with_timeout(Duration::from_millis(100));
    assert!(matches!(client.jobs(&filter).await, Err(QueryError::Internal)));

    trigger.trigger();
    responder.await.unwrap().unwrap();
}

#[tokio::test]
async fn redispatch_and_status_feed_over_the_bus() {
    let store = MemoryStore::new();
    let bus = MemoryBus::new();
    let engine = DispatchEngine::new(store.clone(), bus.clone());

    bus.set_publish_failure(true);
    let event = JobCreatedEvent {
        job_id: "0xabc".into(),
        renter_address: "0xRenter".into(),
        provider_address: "0xP".into(),
        docker_image: "img:1".into(),
        input_file_cid: "Qm1".into(),
        payment_amount: "5".into(),
        block_number: 1,
        transaction_hash: "0xtx".into(),
    };
    assert!(engine.on_job_created(&event).await.is_err());
    bus.set_publish_failure(false);

    let (trigger, stop) = shutdown::channel();
    let redispatch = tokio::spawn(serve_queries(
        bus.clone(),
        REDISPATCH_SUBJECT.to_string(),
        Redispatch(engine.clone()),
        stop.clone(),
    ));
    let status_feed = tokio::spawn(consume_status_updates(engine.clone(), bus.clone(), stop));
    tokio::task::yield_now().await;

    let client = QueryClient::new(bus.clone());
    let reply: RedispatchReply = client
        .request(
            REDISPATCH_SUBJECT,
            &RedispatchRequest {
                job_id: "0xabc".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.status, Some(JobStatus::Assigned));
    assert!(reply.error.is_none());

    let reply: RedispatchReply = client
        .request(
            REDISPATCH_SUBJECT,
            &RedispatchRequest {
                job_id: "0xabc".into(),
            },
        )
        .await
        .unwrap();
    assert!(reply.error.is_some());

    publish_json(
        &bus,
        STATUS_SUBJECT,
        &JobStatusUpdate {
            job_id: "0xabc".into(),
            status: JobStatus::Running,
            output_file_cid: None,
            error_message: None,
        },
    )
    .await
    .unwrap();

    let mut running = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if store.get_job("0xabc").await.unwrap().unwrap().status == JobStatus::Running {
            running = true;
            break;
        }
    }
    assert!(running);

    trigger.trigger();
    redispatch.await.unwrap().unwrap();
    status_feed.await.unwrap().unwrap();
}
