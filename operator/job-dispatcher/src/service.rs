//! Bus-facing side of the dispatcher: the `jobs.query` responder, the
//! operator `jobs.redispatch` request and the worker `jobs.status` feed.

use anyhow::Result;
use market_framework::bus::MessageBus;
use market_framework::model::{JobStatus, JobStatusUpdate};
use market_framework::query::{JobFilter, JobsResponse, QueryHandler};
use market_framework::shutdown::Shutdown;
use market_framework::store::JobStore;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::DispatchEngine;

pub const REDISPATCH_SUBJECT: &str = "jobs.redispatch";
pub const STATUS_SUBJECT: &str = "jobs.status";

pub struct JobsQuery<S, B>(pub DispatchEngine<S, B>);

impl<S: JobStore, B: MessageBus> QueryHandler for JobsQuery<S, B> {
    type Request = JobFilter;
    type Response = JobsResponse;

    async fn answer(&self, filter: JobFilter) -> Result<JobsResponse> {
        Ok(self.0.list_jobs(&filter).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedispatchRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedispatchReply {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Redispatch<S, B>(pub DispatchEngine<S, B>);

impl<S: JobStore, B: MessageBus> QueryHandler for Redispatch<S, B> {
    type Request = RedispatchRequest;
    type Response = RedispatchReply;

    async fn answer(&self, request: RedispatchRequest) -> Result<RedispatchReply> {
        let reply = match self.0.redispatch(&request.job_id).await {
            Ok(job) => RedispatchReply {
                job_id: job.id,
                status: Some(job.status),
                error: None,
            },
            Err(err) => {
                warn!(job_id = %request.job_id, error = ?err, "Redispatch rejected");
                RedispatchReply {
                    job_id: request.job_id,
                    status: None,
                    error: Some(err.to_string()),
                }
            }
        };
        Ok(reply)
    }
}

/// Applies worker status reports until shutdown. Rejected updates are
/// logged and dropped.
pub async fn consume_status_updates<S, B>(
    engine: DispatchEngine<S, B>,
    bus: B,
    mut shutdown: Shutdown,
) -> Result<()>
where
    S: JobStore,
    B: MessageBus,
{
    let mut updates = bus.subscribe(STATUS_SUBJECT).await?;
    info!(subject = STATUS_SUBJECT, "Listening for job status updates");

    loop {
        let message = tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            message = updates.next() => message,
        };
        let Some(message) = message else {
            warn!(subject = STATUS_SUBJECT, "Status subscription closed");
            return Ok(());
        };

        let update: JobStatusUpdate = match serde_json::from_slice(&message.payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(error = ?err, "Dropping malformed status update");
                continue;
            }
        };

        if let Err(err) = engine.apply_status_update(&update).await {
            error!(job_id = %update.job_id, status = %update.status, error = ?err, "Failed to apply status update");
        }
    }
}
