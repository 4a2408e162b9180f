use anyhow::Result;
use chrono::Utc;
use market_framework::bus::{MessageBus, dispatch_subject, publish_json};
use market_framework::chain::EventHandler;
use market_framework::error::{BusError, HandleError, StoreError};
use market_framework::model::{Job, JobAssignment, JobStatus, JobStatusUpdate, StatusChange};
use market_framework::query::{JobFilter, JobsResponse};
use market_framework::store::JobStore;
use thiserror::Error;
use tracing::{info, instrument};

use crate::chain::JobCreatedEvent;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("job {0} already exists")]
    Duplicate(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} changed concurrently")]
    Conflict(String),

    #[error("failed to publish assignment for job {job_id}")]
    Publish {
        job_id: String,
        #[source]
        source: BusError,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => DispatchError::Duplicate(id),
            StoreError::NotFound(id) => DispatchError::NotFound(id),
            other => DispatchError::Store(other),
        }
    }
}

/// Turns escrowed jobs into assignments delivered to their provider.
#[derive(Clone)]
pub struct DispatchEngine<S, B> {
    store: S,
    bus: B,
}

impl<S: JobStore, B: MessageBus> DispatchEngine<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    /// Records a freshly escrowed job and dispatches it right away. A
    /// replayed event is rejected as a duplicate and the stored row is left
    /// untouched.
    pub async fn on_job_created(&self, event: &JobCreatedEvent) -> Result<Job, DispatchError> {
        let job = self.record_job(event).await?;
        self.dispatch(&job).await
    }

    async fn record_job(&self, event: &JobCreatedEvent) -> Result<Job, DispatchError> {
        let job = self.store.insert_job(event.new_job(), Utc::now()).await?;
        info!(
            job_id = %job.id,
            provider = %job.provider_address,
            block = event.block_number,
            tx_hash = %event.transaction_hash,
            "Recorded new job"
        );
        Ok(job)
    }

    /// Publishes the assignment, then moves the job to `assigned`. A failed
    /// publish leaves the job in `created`.
    pub async fn dispatch(&self, job: &Job) -> Result<Job, DispatchError> {
        if job.status != JobStatus::Created {
            return Err(DispatchError::IllegalTransition {
                job_id: job.id.clone(),
                from: job.status,
                to: JobStatus::Assigned,
            });
        }

        let subject = dispatch_subject(&job.provider_address);
        publish_json(&self.bus, &subject, &JobAssignment::from(job))
            .await
            .map_err(|source| DispatchError::Publish {
                job_id: job.id.clone(),
                source,
            })?;

        let assigned = self
            .store
            .transition_job(&job.id, JobStatus::Created, &StatusChange::assigned(Utc::now()))
            .await?
            .ok_or_else(|| DispatchError::Conflict(job.id.clone()))?;

        info!(job_id = %job.id, subject, "Dispatched job to provider");
        Ok(assigned)
    }

    /// Retries delivery of a job still waiting in `created`.
    #[instrument(level = "info", skip(self))]
    pub async fn redispatch(&self, job_id: &str) -> Result<Job, DispatchError> {
        let job = self.get_job(job_id).await?;
        self.dispatch(&job).await
    }

    /// Applies worker-reported progress along the lifecycle graph.
    pub async fn apply_status_update(&self, update: &JobStatusUpdate) -> Result<Job, DispatchError> {
        let job = self.get_job(&update.job_id).await?;

        if !job.status.can_transition_to(update.status) {
            return Err(DispatchError::IllegalTransition {
                job_id: job.id,
                from: job.status,
                to: update.status,
            });
        }

        let change = StatusChange {
            status: update.status,
            at: Utc::now(),
            output_file_cid: update.output_file_cid.clone(),
            error_message: update.error_message.clone(),
        };
        let updated = self
            .store
            .transition_job(&job.id, job.status, &change)
            .await?
            .ok_or_else(|| DispatchError::Conflict(job.id.clone()))?;

        info!(job_id = %updated.id, from = %job.status, to = %updated.status, "Job status updated");
        Ok(updated)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, DispatchError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(job_id.to_string()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobsResponse, DispatchError> {
        Ok(self.store.list_jobs(filter).await?.into())
    }
}

impl<S: JobStore, B: MessageBus> EventHandler<JobCreatedEvent> for DispatchEngine<S, B> {
    async fn handle(&self, event: &JobCreatedEvent) -> Result<(), HandleError> {
        let job = self.record_job(event).await.map_err(|err| match err {
            DispatchError::Store(store) => HandleError::from_store(store),
            other => HandleError::Skip(other.into()),
        })?;
        // The row exists from here on, so a replay only ever sees a duplicate.
        // An undelivered job waits in `created` for a redispatch.
        self.dispatch(&job)
            .await
            .map_err(|err| HandleError::Skip(err.into()))?;
        Ok(())
    }
}
