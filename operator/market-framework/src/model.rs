use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the job lifecycle. Nothing moves backward and terminal
    /// states accept nothing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::Assigned)
                | (JobStatus::Created, JobStatus::Cancelled)
                | (JobStatus::Assigned, JobStatus::Running)
                | (JobStatus::Assigned, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(StoreError::Invalid(format!("unknown job status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub renter_address: String,
    pub provider_address: String,
    pub docker_image: String,
    pub input_file_cid: String,
    pub output_file_cid: Option<String>,
    /// Decimal string, arbitrary precision.
    pub payment_amount: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Fields known when a job first appears on the payment chain.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: String,
    pub renter_address: String,
    pub provider_address: String,
    pub docker_image: String,
    pub input_file_cid: String,
    pub payment_amount: String,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            renter_address: self.renter_address,
            provider_address: self.provider_address,
            docker_image: self.docker_image,
            input_file_cid: self.input_file_cid,
            output_file_cid: None,
            payment_amount: self.payment_amount,
            status: JobStatus::Created,
            error_message: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            completed_at: None,
            failed_at: None,
        }
    }
}

/// A status move together with the stamps it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub output_file_cid: Option<String>,
    pub error_message: Option<String>,
}

impl StatusChange {
    pub fn assigned(at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Assigned,
            at,
            output_file_cid: None,
            error_message: None,
        }
    }
}

impl Job {
    pub fn apply(&mut self, change: &StatusChange) {
        self.status = change.status;
        self.updated_at = change.at;

        match change.status {
            JobStatus::Assigned => self.assigned_at = Some(change.at),
            JobStatus::Completed => self.completed_at = Some(change.at),
            JobStatus::Failed | JobStatus::Cancelled => self.failed_at = Some(change.at),
            JobStatus::Created | JobStatus::Running => {}
        }

        if let Some(cid) = &change.output_file_cid {
            self.output_file_cid = Some(cid.clone());
        }
        if let Some(message) = &change.error_message {
            self.error_message = Some(message.clone());
        }
    }
}

/// Work order pushed to a provider on `jobs.dispatch.<provider>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "dockerImage")]
    pub docker_image: String,
    #[serde(rename = "inputFileCID")]
    pub input_file_cid: String,
}

impl From<&Job> for JobAssignment {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            docker_image: job.docker_image.clone(),
            input_file_cid: job.input_file_cid.clone(),
        }
    }
}

/// Worker-reported progress for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Provider {
    pub wallet_address: String,
    pub gpu_model: String,
    pub vram: i64,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
    pub total_jobs_completed: i64,
    pub reputation_score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRegistration {
    pub wallet_address: String,
    pub gpu_model: String,
    pub vram: i64,
}
