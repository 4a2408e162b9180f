use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Job, JobStatus, NewJob, Provider, ProviderRegistration, StatusChange};
use crate::query::{JobFilter, NodeFilter};

pub trait JobStore: Clone + Send + Sync + 'static {
    /// Fails with [`StoreError::Duplicate`] when the id is already present.
    fn insert_job(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Job, StoreError>> + Send;

    fn get_job(&self, id: &str) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    /// Applies `change` only if the row is still in `from`. Returns the
    /// updated row, or `None` when the row moved on or does not exist.
    fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        change: &StatusChange,
    ) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    /// Newest first.
    fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;
}

pub trait ProviderStore: Clone + Send + Sync + 'static {
    /// Inserts or overwrites hardware details and marks the provider online.
    fn upsert_provider(
        &self,
        registration: &ProviderRegistration,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Provider, StoreError>> + Send;

    /// Returns false when no row exists for the wallet.
    fn touch_provider(
        &self,
        wallet_address: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Flips online providers last seen before `cutoff`. Returns the number
    /// of rows changed.
    fn mark_offline_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn get_provider(
        &self,
        wallet_address: &str,
    ) -> impl Future<Output = Result<Option<Provider>, StoreError>> + Send;

    /// Online providers only, highest reputation first.
    fn list_active_providers(
        &self,
        filter: &NodeFilter,
    ) -> impl Future<Output = Result<Vec<Provider>, StoreError>> + Send;

    /// Mirrors a settled job: sets the reputation to the on-chain job count
    /// and bumps the completed counter. Returns false for unknown wallets.
    fn record_settlement(
        &self,
        wallet_address: &str,
        job_count: i64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Last fully scanned block per synchronizing service.
pub trait CursorStore: Clone + Send + Sync + 'static {
    fn load_cursor(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    fn save_cursor(
        &self,
        service: &str,
        block: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    providers: HashMap<String, Provider>,
    cursors: HashMap<String, u64>,
    unavailable: bool,
}

/// Process-local store with the same semantics as the Postgres repository.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable = unavailable;
    }

    pub fn provider_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .providers
            .len()
    }

    /// Test hook for ageing a provider's heartbeat.
    pub fn set_last_seen(&self, wallet_address: &str, last_seen: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = state.providers.get_mut(wallet_address) {
            provider.last_seen = last_seen;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.unavailable {
            return Err(StoreError::Unavailable);
        }
        Ok(state)
    }
}

fn paginate<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.into_iter().skip(offset).take(limit).collect()
}

impl JobStore for MemoryStore {
    async fn insert_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut state = self.lock()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let job = job.into_job(now);
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    async fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        change: &StatusChange,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock()?;
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(None);
        };
        if job.status != from {
            return Ok(None);
        }
        job.apply(change);
        Ok(Some(job.clone()))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.lock()?;
        let filter = filter.normalized();

        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                filter
                    .renter_address
                    .as_ref()
                    .is_none_or(|renter| &job.renter_address == renter)
                    && filter
                        .provider_address
                        .as_ref()
                        .is_none_or(|provider| &job.provider_address == provider)
                    && filter.status.is_none_or(|status| job.status == status)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let page = filter.page();
        Ok(paginate(jobs, page.limit, page.offset))
    }
}

impl ProviderStore for MemoryStore {
    async fn upsert_provider(
        &self,
        registration: &ProviderRegistration,
        now: DateTime<Utc>,
    ) -> Result<Provider, StoreError> {
        let mut state = self.lock()?;
        let provider = state
            .providers
            .entry(registration.wallet_address.clone())
            .and_modify(|existing| {
                existing.gpu_model = registration.gpu_model.clone();
                existing.vram = registration.vram;
                existing.last_seen = now;
                existing.is_online = true;
                existing.updated_at = now;
            })
            .or_insert_with(|| Provider {
                wallet_address: registration.wallet_address.clone(),
                gpu_model: registration.gpu_model.clone(),
                vram: registration.vram,
                last_seen: now,
                is_online: true,
                total_jobs_completed: 0,
                reputation_score: 0,
                created_at: now,
                updated_at: now,
            });
        Ok(provider.clone())
    }

    async fn touch_provider(
        &self,
        wallet_address: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(provider) = state.providers.get_mut(wallet_address) else {
            return Ok(false);
        };
        provider.last_seen = now;
        provider.is_online = true;
        provider.updated_at = now;
        Ok(true)
    }

    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut changed = 0;
        for provider in state.providers.values_mut() {
            if provider.is_online && provider.last_seen < cutoff {
                provider.is_online = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_provider(&self, wallet_address: &str) -> Result<Option<Provider>, StoreError> {
        Ok(self.lock()?.providers.get(wallet_address).cloned())
    }

    async fn list_active_providers(&self, filter: &NodeFilter) -> Result<Vec<Provider>, StoreError> {
        let state = self.lock()?;
        let filter = filter.normalized();

        let mut providers: Vec<Provider> = state
            .providers
            .values()
            .filter(|provider| {
                provider.is_online
                    && filter.min_vram.is_none_or(|vram| provider.vram >= vram)
                    && filter
                        .gpu_model
                        .as_ref()
                        .is_none_or(|model| &provider.gpu_model == model)
                    && filter
                        .min_reputation_score
                        .is_none_or(|score| provider.reputation_score >= score)
            })
            .cloned()
            .collect();
        providers.sort_by(|a, b| {
            b.reputation_score
                .cmp(&a.reputation_score)
                .then_with(|| a.wallet_address.cmp(&b.wallet_address))
        });

        let page = filter.page();
        Ok(paginate(providers, page.limit, page.offset))
    }

    async fn record_settlement(
        &self,
        wallet_address: &str,
        job_count: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(provider) = state.providers.get_mut(wallet_address) else {
            return Ok(false);
        };
        provider.reputation_score = job_count;
        provider.total_jobs_completed += 1;
        provider.updated_at = now;
        Ok(true)
    }
}

impl CursorStore for MemoryStore {
    async fn load_cursor(&self, service: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.lock()?.cursors.get(service).copied())
    }

    async fn save_cursor(&self, service: &str, block: u64) -> Result<(), StoreError> {
        self.lock()?.cursors.insert(service.to_string(), block);
        Ok(())
    }
}
