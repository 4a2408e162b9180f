use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_nats::RequestErrorKind;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::BusError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Messages delivered to one subscription, in arrival order.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// `None` once the underlying subscription is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Publish, subscribe and request/reply over subjects.
pub trait MessageBus: Clone + Send + Sync + 'static {
    fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        wait: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, BusError>> + Send;

    fn subscribe(
        &self,
        subject: &str,
    ) -> impl Future<Output = Result<Subscription, BusError>> + Send;
}

pub async fn publish_json<B, T>(bus: &B, subject: &str, value: &T) -> Result<(), BusError>
where
    B: MessageBus,
    T: Serialize + Sync,
{
    let payload = serde_json::to_vec(value).map_err(|err| BusError::Publish {
        subject: subject.to_string(),
        source: err.into(),
    })?;
    bus.publish(subject, payload).await
}

#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        info!(url, "Connecting to NATS");

        let client = timeout(CONNECT_TIMEOUT, async_nats::connect(url))
            .await
            .map_err(|_| BusError::Connect(anyhow!("timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(|err| BusError::Connect(err.into()))?;

        info!("Connected to NATS");
        Ok(Self { client })
    }
}

impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|err| BusError::Publish {
                subject: subject.to_string(),
                source: err.into(),
            })?;

        // Surface connection failures here instead of losing the message
        // silently in the client buffer.
        self.client
            .flush()
            .await
            .map_err(|err| BusError::Publish {
                subject: subject.to_string(),
                source: err.into(),
            })
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let reply = timeout(
            wait,
            self.client.request(subject.to_string(), payload.into()),
        )
        .await
        .map_err(|_| BusError::Timeout(subject.to_string()))?
        .map_err(|err| match err.kind() {
            RequestErrorKind::NoResponders => BusError::NoResponders(subject.to_string()),
            RequestErrorKind::TimedOut => BusError::Timeout(subject.to_string()),
            _ => BusError::Request {
                subject: subject.to_string(),
                source: err.into(),
            },
        })?;

        Ok(reply.payload.to_vec())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|err| BusError::Subscribe {
                subject: subject.to_string(),
                source: err.into(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let subject = subject.to_string();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let forwarded = BusMessage {
                    subject: message.subject.to_string(),
                    reply: message.reply.map(|reply| reply.to_string()),
                    payload: message.payload.to_vec(),
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            debug!(subject, "NATS subscription closed");
        });

        Ok(Subscription { rx })
    }
}

#[derive(Default)]
struct MemoryBusState {
    subscribers: Vec<(String, mpsc::UnboundedSender<BusMessage>)>,
    published: Vec<BusMessage>,
    fail_publish: bool,
}

/// In-process bus with NATS subject matching, used by the test suites and for
/// running a service without a broker.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
    inbox_seq: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until reset.
    pub fn set_publish_failure(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Every message published so far, replies included.
    pub fn published(&self) -> Vec<BusMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, subject: &str) -> Vec<BusMessage> {
        self.lock()
            .published
            .iter()
            .filter(|message| message.subject == subject)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, message: BusMessage) -> Result<usize, BusError> {
        let mut state = self.lock();
        if state.fail_publish {
            return Err(BusError::Publish {
                subject: message.subject,
                source: anyhow!("bus unavailable"),
            });
        }

        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (pattern, tx) in state.subscribers.iter() {
            if subject_matches(pattern, &message.subject) && tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        state.published.push(message);
        Ok(delivered)
    }

    fn register(&self, subject: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push((subject.to_string(), tx));
        Subscription { rx }
    }
}

impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        })?;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_INBOX.{}", self.inbox_seq.fetch_add(1, Ordering::Relaxed));
        let mut replies = self.register(&inbox);

        let delivered = self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: Some(inbox),
            payload,
        })?;
        if delivered == 0 {
            return Err(BusError::NoResponders(subject.to_string()));
        }

        match timeout(wait, replies.next()).await {
            Ok(Some(reply)) => Ok(reply.payload),
            Ok(None) | Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        Ok(self.register(subject))
    }
}

/// NATS token matching: `*` matches one token, a trailing `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Subject on which a provider listens for its assignments.
pub fn dispatch_subject(provider_address: &str) -> String {
    format!("jobs.dispatch.{provider_address}")
}
