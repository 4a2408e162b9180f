use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::SaturatingConvert;

/// Number of recent pass outcomes the error rate is computed over.
const RECENT_WINDOW: usize = 100;

#[derive(Clone, Copy, Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Copy, Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum HealthReason {
    /// A long-running task of the service has stopped.
    TaskStopped,
    /// Cursor is further behind the head than a few polling windows.
    ChainLag,
    /// Failing, but still inside the startup grace period.
    StartupInstability,
    SustainedErrors,
    Stalled,
    Lagging,
    IntermittentErrors,
}

#[derive(Clone, Serialize, Debug)]
pub struct HealthReport {
    pub service: String,
    pub status: HealthStatus,
    pub reason: Option<HealthReason>,
    pub last_processed_block: Option<i64>,
    pub chain_head: Option<i64>,
    pub last_error: Option<String>,
    pub failed_tasks: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub startup_grace: Duration,
    pub unhealthy_consecutive_errors: u64,
    pub degraded_consecutive_errors: u64,
    pub unhealthy_error_rate: f64,
    pub degraded_error_rate: f64,
    pub unhealthy_stale: Duration,
    pub degraded_stale: Duration,
    pub unhealthy_lag: i64,
    pub degraded_lag: i64,
}

impl HealthConfig {
    /// Thresholds scaled to how many blocks one polling pass may cover.
    pub fn for_range(range_size: u64) -> Self {
        let range: i64 = range_size.saturating_to();
        Self {
            startup_grace: Duration::from_secs(300),
            unhealthy_consecutive_errors: 5,
            degraded_consecutive_errors: 3,
            unhealthy_error_rate: 0.40,
            degraded_error_rate: 0.20,
            unhealthy_stale: Duration::from_secs(180),
            degraded_stale: Duration::from_secs(60),
            unhealthy_lag: range.saturating_mul(3),
            degraded_lag: range.saturating_mul(2),
        }
    }
}

/// Sliding window of pass outcomes with a running failure count.
#[derive(Clone, Default)]
struct Outcomes {
    window: VecDeque<bool>,
    failures: usize,
}

impl Outcomes {
    fn push(&mut self, ok: bool) {
        if self.window.len() == RECENT_WINDOW && self.window.pop_front() == Some(false) {
            self.failures -= 1;
        }
        self.window.push_back(ok);
        if !ok {
            self.failures += 1;
        }
    }

    fn trailing_failures(&self) -> u64 {
        self.window
            .iter()
            .rev()
            .take_while(|ok| !**ok)
            .count()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.window.len() as f64
    }
}

#[derive(Clone)]
struct HealthState {
    started: SystemTime,
    last_progress: SystemTime,
    last_processed_block: Option<i64>,
    chain_head: Option<i64>,
    outcomes: Outcomes,
    last_error: Option<String>,
    failed_tasks: Vec<String>,
}

/// Shared between a service's loops and its `/health` endpoint.
#[derive(Clone)]
pub struct HealthTracker {
    service: Arc<str>,
    state: Arc<Mutex<HealthState>>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(service: &str, config: HealthConfig) -> Self {
        let now = SystemTime::now();
        Self {
            service: service.into(),
            state: Arc::new(Mutex::new(HealthState {
                started: now,
                last_progress: now,
                last_processed_block: None,
                chain_head: None,
                outcomes: Outcomes::default(),
                last_error: None,
                failed_tasks: Vec::new(),
            })),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A pass finished without error. `block` is the new cursor, if the
    /// loop tracks one.
    pub fn record_progress(&self, block: Option<u64>) {
        let mut state = self.lock();
        state.last_progress = SystemTime::now();
        state.last_error = None;
        if let Some(block) = block {
            state.last_processed_block = Some(block.saturating_to());
        }
        state.outcomes.push(true);
    }

    pub fn record_error(&self, msg: impl Into<String>) {
        let mut state = self.lock();
        state.last_error = Some(msg.into());
        state.outcomes.push(false);
    }

    /// Marks a task as dead. The report stays unhealthy from then on.
    pub fn record_task_failure(&self, task: &str, msg: impl Into<String>) {
        let mut state = self.lock();
        state.last_error = Some(format!("{task}: {}", msg.into()));
        state.failed_tasks.push(task.to_string());
    }

    pub fn update_chain_head(&self, block: u64) {
        self.lock().chain_head = Some(block.saturating_to());
    }

    pub fn get_report(&self) -> HealthReport {
        let state = self.lock().clone();
        let (status, reason) = self.assess(&state, SystemTime::now());

        HealthReport {
            service: self.service.to_string(),
            status,
            reason,
            last_processed_block: state.last_processed_block,
            chain_head: state.chain_head,
            last_error: state.last_error,
            failed_tasks: state.failed_tasks,
        }
    }

    fn assess(&self, state: &HealthState, now: SystemTime) -> (HealthStatus, Option<HealthReason>) {
        if !state.failed_tasks.is_empty() {
            return (HealthStatus::Unhealthy, Some(HealthReason::TaskStopped));
        }

        let config = &self.config;
        let lag = match (state.chain_head, state.last_processed_block) {
            (Some(head), Some(block)) => head.saturating_sub(block),
            _ => 0,
        };
        if lag > config.unhealthy_lag {
            return (HealthStatus::Unhealthy, Some(HealthReason::ChainLag));
        }

        let uptime = now.duration_since(state.started).unwrap_or_default();
        let idle = now
            .duration_since(state.last_progress)
            .unwrap_or(Duration::MAX);
        let trailing = state.outcomes.trailing_failures();
        let rate = state.outcomes.failure_rate();

        let failing = trailing >= config.unhealthy_consecutive_errors
            || rate > config.unhealthy_error_rate;
        let stalled = idle > config.unhealthy_stale;
        if failing || stalled {
            if uptime < config.startup_grace {
                return (HealthStatus::Degraded, Some(HealthReason::StartupInstability));
            }
            let reason = if failing {
                HealthReason::SustainedErrors
            } else {
                HealthReason::Stalled
            };
            return (HealthStatus::Unhealthy, Some(reason));
        }

        if lag > config.degraded_lag {
            return (HealthStatus::Degraded, Some(HealthReason::Lagging));
        }
        if trailing >= config.degraded_consecutive_errors || rate > config.degraded_error_rate {
            return (HealthStatus::Degraded, Some(HealthReason::IntermittentErrors));
        }
        if idle > config.degraded_stale {
            return (HealthStatus::Degraded, Some(HealthReason::Stalled));
        }

        (HealthStatus::Healthy, None)
    }
}

pub async fn start_health_server(health: HealthTracker, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(health);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind health server to port {port}"))?;
    info!(port, "Health check server listening");

    axum::serve(listener, app)
        .await
        .context("Health server stopped")
}

/// Runs the health server in the background, restarting it if it exits.
pub fn spawn_health_server(health: HealthTracker, port: u16) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = start_health_server(health.clone(), port).await {
                error!(error = ?err, "Health server crashed, restarting in 5s");
            } else {
                warn!("Health server exited, restarting in 5s");
            }
            sleep(Duration::from_secs(5)).await;
        }
    });
}

async fn health_handler(State(health): State<HealthTracker>) -> (StatusCode, Json<HealthReport>) {
    let report = health.get_report();

    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (code, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_without_grace() -> HealthTracker {
        let mut config = HealthConfig::for_range(5);
        config.startup_grace = Duration::from_secs(0);
        HealthTracker::new("test", config)
    }

    #[test]
    fn test_fresh_tracker_is_healthy() {
        let report = HealthTracker::new("test", HealthConfig::for_range(5)).get_report();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.reason.is_none());
        assert_eq!(report.service, "test");
    }

    #[test]
    fn test_progress_records_cursor_and_clears_error() {
        let tracker = tracker_without_grace();
        tracker.record_error("rpc down");
        tracker.record_progress(Some(100));

        let report = tracker.get_report();
        assert_eq!(report.last_processed_block, Some(100));
        assert!(report.last_error.is_none());
    }

    #[test]
    fn test_errors_during_startup_only_degrade() {
        let tracker = HealthTracker::new("test", HealthConfig::for_range(5));
        for _ in 0..5 {
            tracker.record_error("rpc down");
        }

        let report = tracker.get_report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.reason, Some(HealthReason::StartupInstability));
        assert_eq!(report.last_error.as_deref(), Some("rpc down"));
    }

    #[test]
    fn test_consecutive_errors_turn_unhealthy() {
        let tracker = tracker_without_grace();
        for _ in 0..5 {
            tracker.record_error("rpc down");
        }
        assert_eq!(tracker.get_report().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_intermittent_errors_degrade() {
        let tracker = tracker_without_grace();
        for _ in 0..5 {
            tracker.record_progress(None);
        }
        for _ in 0..3 {
            tracker.record_error("flaky");
            tracker.record_progress(None);
        }

        let report = tracker.get_report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.reason, Some(HealthReason::IntermittentErrors));
    }

    #[test]
    fn test_stalled_loop_is_unhealthy() {
        let tracker = tracker_without_grace();
        tracker.lock().last_progress = SystemTime::now() - Duration::from_secs(200);

        let report = tracker.get_report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.reason, Some(HealthReason::Stalled));
    }

    #[test]
    fn test_chain_lag_thresholds() {
        let tracker = tracker_without_grace();
        tracker.record_progress(Some(100));
        tracker.update_chain_head(112);
        let report = tracker.get_report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.reason, Some(HealthReason::Lagging));

        tracker.update_chain_head(120);
        let report = tracker.get_report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.reason, Some(HealthReason::ChainLag));
    }

    #[test]
    fn test_recovers_after_errors() {
        let tracker = tracker_without_grace();
        for _ in 0..5 {
            tracker.record_error("rpc down");
        }
        assert_eq!(tracker.get_report().status, HealthStatus::Unhealthy);

        for block in 0..30 {
            tracker.record_progress(Some(100 + block));
        }
        assert_eq!(tracker.get_report().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_stopped_task_is_unhealthy_even_during_startup() {
        let tracker = HealthTracker::new("test", HealthConfig::for_range(5));
        tracker.record_task_failure("sweeper", "store unreachable");
        tracker.record_progress(Some(10));

        let report = tracker.get_report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.reason, Some(HealthReason::TaskStopped));
        assert_eq!(report.failed_tasks, vec!["sweeper".to_string()]);
    }

    #[test]
    fn test_outcome_window_forgets_old_failures() {
        let mut outcomes = Outcomes::default();
        for _ in 0..10 {
            outcomes.push(false);
        }
        assert_eq!(outcomes.trailing_failures(), 10);

        for _ in 0..RECENT_WINDOW {
            outcomes.push(true);
        }
        assert_eq!(outcomes.failures, 0);
        assert_eq!(outcomes.trailing_failures(), 0);
        assert_eq!(outcomes.failure_rate(), 0.0);
    }

    #[test]
    fn test_report_serializes_for_the_endpoint() {
        let tracker = tracker_without_grace();
        tracker.update_chain_head(50);
        let body = serde_json::to_value(tracker.get_report()).unwrap();

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["chain_head"], 50);
        assert!(body["reason"].is_null());
    }
}
