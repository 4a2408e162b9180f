use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, Subscription};
use crate::error::{BusError, QueryError};
use crate::model::{Job, JobStatus, Provider};
use crate::shutdown::Shutdown;

pub const JOBS_QUERY_SUBJECT: &str = "jobs.query";
pub const NODES_QUERY_SUBJECT: &str = "nodes.query";

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Missing or non-positive limits fall back to the default, oversized ones
    /// are capped, negative offsets clamp to zero.
    pub fn resolve(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = match limit {
            Some(limit) if limit > 0 => limit.min(MAX_LIMIT),
            _ => DEFAULT_LIMIT,
        };
        Self {
            limit,
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|value| !value.is_empty()).cloned()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renter_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl JobFilter {
    /// Empty strings mean "no filter".
    pub fn normalized(&self) -> Self {
        Self {
            renter_address: non_empty(&self.renter_address),
            provider_address: non_empty(&self.provider_address),
            ..self.clone()
        }
    }

    pub fn page(&self) -> Page {
        Page::resolve(self.limit, self.offset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_vram: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reputation_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl NodeFilter {
    pub fn normalized(&self) -> Self {
        Self {
            gpu_model: non_empty(&self.gpu_model),
            ..self.clone()
        }
    }

    pub fn page(&self) -> Page {
        Page::resolve(self.limit, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

impl From<Vec<Job>> for JobsResponse {
    fn from(jobs: Vec<Job>) -> Self {
        Self {
            count: jobs.len(),
            jobs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<Provider>,
    pub count: usize,
}

impl From<Vec<Provider>> for NodesResponse {
    fn from(nodes: Vec<Provider>) -> Self {
        Self {
            count: nodes.len(),
            nodes,
        }
    }
}

/// Answers one kind of typed bus request.
pub trait QueryHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send + Sync;

    fn answer(
        &self,
        request: Self::Request,
    ) -> impl Future<Output = anyhow::Result<Self::Response>> + Send;
}

/// Serves requests on `subject` until shutdown.
///
/// Malformed requests and handler failures get no reply; the caller's
/// timeout reports them. Neither stops the loop.
pub async fn serve_queries<B, H>(
    bus: B,
    subject: String,
    handler: H,
    mut shutdown: Shutdown,
) -> anyhow::Result<()>
where
    B: MessageBus,
    H: QueryHandler,
{
    let mut requests: Subscription = bus.subscribe(&subject).await?;
    info!(subject, "Query responder listening");

    loop {
        let message = tokio::select! {
            _ = shutdown.wait() => {
                info!(subject, "Query responder stopping");
                return Ok(());
            }
            message = requests.next() => message,
        };

        let Some(message) = message else {
            warn!(subject, "Query subscription closed");
            return Ok(());
        };

        let Some(reply) = message.reply else {
            debug!(subject, "Dropping query without a reply subject");
            continue;
        };

        let request: H::Request = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(subject, error = ?err, "Dropping malformed query");
                continue;
            }
        };

        let response = match handler.answer(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(subject, error = ?err, "Failed to answer query");
                continue;
            }
        };

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                error!(subject, error = ?err, "Failed to encode query response");
                continue;
            }
        };

        if let Err(err) = bus.publish(&reply, payload).await {
            error!(subject, error = ?err, "Failed to send query reply");
        }
    }
}

/// Caller side of the bus queries.
#[derive(Clone)]
pub struct QueryClient<B> {
    bus: B,
    timeout: Duration,
}

impl<B: MessageBus> QueryClient<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn jobs(&self, filter: &JobFilter) -> Result<JobsResponse, QueryError> {
        self.request(JOBS_QUERY_SUBJECT, filter).await
    }

    pub async fn nodes(&self, filter: &NodeFilter) -> Result<NodesResponse, QueryError> {
        self.request(NODES_QUERY_SUBJECT, filter).await
    }

    pub async fn request<Req, Resp>(&self, subject: &str, request: &Req) -> Result<Resp, QueryError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(request).map_err(|err| QueryError::Invalid(err.to_string()))?;

        let reply = self
            .bus
            .request(subject, payload, self.timeout)
            .await
            .map_err(|err: BusError| {
                error!(subject, error = ?err, "Bus query failed");
                QueryError::Internal
            })?;

        serde_json::from_slice(&reply).map_err(|err| {
            error!(subject, error = ?err, "Malformed query reply");
            QueryError::Internal
        })
    }
}
