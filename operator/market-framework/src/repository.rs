use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::SaturatingConvert;
use crate::error::StoreError;
use crate::model::{Job, JobStatus, NewJob, Provider, ProviderRegistration, StatusChange};
use crate::query::{JobFilter, NodeFilter};
use crate::store::{CursorStore, JobStore, ProviderStore};

macro_rules! job_columns {
    () => {
        "id, renter_address, provider_address, docker_image, input_file_cid, output_file_cid, \
         payment_amount::TEXT AS payment_amount, status, error_message, \
         created_at, updated_at, assigned_at, completed_at, failed_at"
    };
}

/// Postgres-backed store shared by every service.
#[derive(Clone, Debug)]
pub struct Repository {
    pub pool: PgPool,
}

impl Repository {
    pub async fn new(db_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("Failed to connect to the DATABASE_URL")?;

        Ok(Self { pool })
    }

    pub async fn apply_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to apply migrations to the database")
    }
}

#[derive(FromRow)]
struct JobRow {
    id: String,
    renter_address: String,
    provider_address: String,
    docker_image: String,
    input_file_cid: String,
    output_file_cid: Option<String>,
    payment_amount: String,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    assigned_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            status: row.status.parse()?,
            id: row.id,
            renter_address: row.renter_address,
            provider_address: row.provider_address,
            docker_image: row.docker_image,
            input_file_cid: row.input_file_cid,
            output_file_cid: row.output_file_cid,
            payment_amount: row.payment_amount,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            assigned_at: row.assigned_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
        })
    }
}

impl JobStore for Repository {
    async fn insert_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(concat!(
            "INSERT INTO jobs (id, renter_address, provider_address, docker_image, \
             input_file_cid, payment_amount, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, 'created', $7, $7) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING ",
            job_columns!()
        ))
        .bind(&job.id)
        .bind(&job.renter_address)
        .bind(&job.provider_address)
        .bind(&job.docker_image)
        .bind(&job.input_file_cid)
        .bind(&job.payment_amount)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(StoreError::Duplicate(job.id)),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Job::try_from).transpose()
    }

    async fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        change: &StatusChange,
    ) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(concat!(
            "UPDATE jobs SET \
                 status = $3::TEXT, \
                 updated_at = $4, \
                 assigned_at = CASE WHEN $3::TEXT = 'assigned' THEN $4 ELSE assigned_at END, \
                 completed_at = CASE WHEN $3::TEXT = 'completed' THEN $4 ELSE completed_at END, \
                 failed_at = CASE WHEN $3::TEXT IN ('failed', 'cancelled') THEN $4 ELSE failed_at END, \
                 output_file_cid = COALESCE($5, output_file_cid), \
                 error_message = COALESCE($6, error_message) \
             WHERE id = $1 AND status = $2 \
             RETURNING ",
            job_columns!()
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(change.status.as_str())
        .bind(change.at)
        .bind(change.output_file_cid.as_deref())
        .bind(change.error_message.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let filter = filter.normalized();
        let page = filter.page();

        let rows: Vec<JobRow> = sqlx::query_as(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs \
             WHERE ($1::TEXT IS NULL OR renter_address = $1) \
               AND ($2::TEXT IS NULL OR provider_address = $2) \
               AND ($3::TEXT IS NULL OR status = $3) \
             ORDER BY created_at DESC, id ASC \
             LIMIT $4 OFFSET $5"
        ))
        .bind(filter.renter_address.as_deref())
        .bind(filter.provider_address.as_deref())
        .bind(filter.status.map(|status| status.as_str()))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }
}

impl ProviderStore for Repository {
    async fn upsert_provider(
        &self,
        registration: &ProviderRegistration,
        now: DateTime<Utc>,
    ) -> Result<Provider, StoreError> {
        let provider = sqlx::query_as(
            r#"
            INSERT INTO providers (
                wallet_address, gpu_model, vram, last_seen, is_online, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, TRUE, $4, $4)
            ON CONFLICT (wallet_address) DO UPDATE SET
                gpu_model = EXCLUDED.gpu_model,
                vram = EXCLUDED.vram,
                last_seen = EXCLUDED.last_seen,
                is_online = TRUE,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(&registration.wallet_address)
        .bind(&registration.gpu_model)
        .bind(registration.vram)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(provider)
    }

    async fn touch_provider(
        &self,
        wallet_address: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE providers SET last_seen = $2, is_online = TRUE, updated_at = $2 \
             WHERE wallet_address = $1",
        )
        .bind(wallet_address)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE providers SET is_online = FALSE, updated_at = NOW() \
             WHERE is_online AND last_seen < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_provider(&self, wallet_address: &str) -> Result<Option<Provider>, StoreError> {
        let provider = sqlx::query_as("SELECT * FROM providers WHERE wallet_address = $1")
            .bind(wallet_address)
            .fetch_optional(&self.pool)
            .await?;

        Ok(provider)
    }

    async fn list_active_providers(&self, filter: &NodeFilter) -> Result<Vec<Provider>, StoreError> {
        let filter = filter.normalized();
        let page = filter.page();

        let providers = sqlx::query_as(
            r#"
            SELECT * FROM providers
            WHERE is_online
              AND ($1::BIGINT IS NULL OR vram >= $1)
              AND ($2::TEXT IS NULL OR gpu_model = $2)
              AND ($3::BIGINT IS NULL OR reputation_score >= $3)
            ORDER BY reputation_score DESC, wallet_address ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.min_vram)
        .bind(filter.gpu_model.as_deref())
        .bind(filter.min_reputation_score)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(providers)
    }

    async fn record_settlement(
        &self,
        wallet_address: &str,
        job_count: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE providers SET reputation_score = $2, \
                 total_jobs_completed = total_jobs_completed + 1, updated_at = $3 \
             WHERE wallet_address = $1",
        )
        .bind(wallet_address)
        .bind(job_count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

impl CursorStore for Repository {
    async fn load_cursor(&self, service: &str) -> Result<Option<u64>, StoreError> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT last_block FROM sync_cursors WHERE service = $1")
                .bind(service)
                .fetch_optional(&self.pool)
                .await?;

        Ok(block.map(|block| block.saturating_to()))
    }

    async fn save_cursor(&self, service: &str, block: u64) -> Result<(), StoreError> {
        let block: i64 = block.saturating_to();
        sqlx::query(
            "INSERT INTO sync_cursors (service, last_block, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (service) DO UPDATE SET \
                 last_block = EXCLUDED.last_block, updated_at = EXCLUDED.updated_at",
        )
        .bind(service)
        .bind(block)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
