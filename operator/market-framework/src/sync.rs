use std::cmp::min;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::sleep;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{EventHandler, EventSource};
use crate::error::{HandleError, SyncError};
use crate::health::HealthTracker;
use crate::shutdown::Shutdown;
use crate::store::CursorStore;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Key under which the cursor is persisted.
    pub service: String,
    pub poll_interval: Duration,
    /// Largest block window fetched at once.
    pub range_size: u64,
    /// First block to scan, overriding a persisted cursor that lies behind it.
    pub start_block: Option<u64>,
}

/// Result of one polling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    UpToDate,
    Advanced {
        from: u64,
        to: u64,
        events: usize,
        failed: usize,
    },
}

fn retry_strategy() -> impl Iterator<Item = Duration> + Clone {
    ExponentialBackoff::from_millis(500)
        .max_delay(Duration::from_secs(10))
        .take(3)
        .map(jitter)
}

/// Drives one chain source through a block cursor, handing every event to
/// the handler. Windows are scanned at least once and never skipped.
pub struct EventSynchronizer<S: EventSource, H, C> {
    source: S,
    handler: H,
    cursors: C,
    kinds: Vec<S::Kind>,
    config: SyncConfig,
    health: Option<HealthTracker>,
    cursor: Option<u64>,
}

impl<S, H, C> EventSynchronizer<S, H, C>
where
    S: EventSource,
    H: EventHandler<S::Event>,
    C: CursorStore,
{
    pub fn new(source: S, handler: H, cursors: C, kinds: Vec<S::Kind>, config: SyncConfig) -> Self {
        Self {
            source,
            handler,
            cursors,
            kinds,
            config,
            health: None,
            cursor: None,
        }
    }

    pub fn with_health(mut self, health: HealthTracker) -> Self {
        self.health = Some(health);
        self
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Resolves the starting cursor: a persisted one if present, else the
    /// chain head observed now. An explicit start block only moves it
    /// forward of a persisted value.
    pub async fn initialize(&mut self) -> Result<u64, SyncError> {
        if self.config.range_size == 0 {
            return Err(SyncError::ZeroRange);
        }

        let service = self.config.service.as_str();
        let persisted = Retry::spawn(retry_strategy(), || async {
            self.cursors.load_cursor(service).await.inspect_err(|err| {
                warn!(error = ?err, "Retrying load_cursor");
            })
        })
        .await
        .map_err(|err| SyncError::Cursor(err.into()))?;

        let mut cursor = match persisted {
            Some(block) => block,
            None => self.source.latest_block().await.map_err(SyncError::Head)?,
        };

        if let Some(start_block) = self.config.start_block {
            let requested = start_block.saturating_sub(1);
            match persisted {
                Some(block) if requested <= block => warn!(
                    start_block,
                    persisted = block,
                    "Provided start block is behind the persisted cursor, starting from the later"
                ),
                _ => cursor = requested,
            }
        }

        info!(service, cursor, persisted = ?persisted, "Resolved starting cursor");
        self.persist(cursor).await;
        self.cursor = Some(cursor);
        Ok(cursor)
    }

    /// One catch-up pass from the cursor to the current chain head.
    ///
    /// Every kind of a window is fetched before any handler runs. A fetch
    /// error or a handler asking for a retry aborts the pass with the cursor
    /// at the end of the last complete window; skipped events are logged and
    /// counted as failed.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, SyncError> {
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => self.initialize().await?,
        };

        let head = self.source.latest_block().await.map_err(SyncError::Head)?;
        if let Some(health) = &self.health {
            health.update_chain_head(head);
        }

        if head <= cursor {
            debug!(head, cursor, "Up-to-date with chain");
            return Ok(PollOutcome::UpToDate);
        }

        let first = cursor + 1;
        let mut events = 0;
        let mut failed = 0;
        let mut from = first;

        while from <= head {
            let to = min(from.saturating_add(self.config.range_size - 1), head);

            let mut batches = Vec::with_capacity(self.kinds.len());
            for kind in self.kinds.iter().copied() {
                let batch = self
                    .source
                    .fetch_events(kind, from, to)
                    .await
                    .map_err(|source| SyncError::Fetch {
                        kind: format!("{kind:?}"),
                        from,
                        to,
                        source,
                    })?;
                batches.push((kind, batch));
            }

            for (kind, batch) in &batches {
                debug!(kind = ?kind, from, to, count = batch.len(), "Handling events");
                for event in batch {
                    events += 1;
                    match self.handler.handle(event).await {
                        Ok(()) => {}
                        Err(HandleError::Skip(err)) => {
                            failed += 1;
                            error!(kind = ?kind, event = ?event, error = ?err, "Failed to handle event, skipping");
                        }
                        Err(HandleError::Retry(source)) => {
                            warn!(kind = ?kind, event = ?event, from, to, error = ?source, "Handler needs a retry, keeping window");
                            return Err(SyncError::Handler { from, to, source });
                        }
                    }
                }
            }

            self.cursor = Some(to);
            self.persist(to).await;
            if let Some(health) = &self.health {
                health.record_progress(Some(to));
            }
            from = to + 1;
        }

        info!(from = first, to = head, events, failed, "Processed block range");
        Ok(PollOutcome::Advanced {
            from: first,
            to: head,
            events,
            failed,
        })
    }

    /// Polls until shutdown. Shutdown is observed between passes only.
    #[instrument(level = "info", skip_all, parent = None, fields(service = %self.config.service))]
    pub async fn run(mut self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        if self.config.range_size == 0 {
            return Err(anyhow!(SyncError::ZeroRange));
        }

        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.poll_once().await {
                Ok(outcome) => {
                    debug!(?outcome, "Polling pass finished");
                    if outcome == PollOutcome::UpToDate {
                        if let Some(health) = &self.health {
                            health.record_progress(None);
                        }
                    }
                }
                Err(err) => {
                    error!(error = ?err, cursor = ?self.cursor, "Polling pass aborted, retrying next tick");
                    if let Some(health) = &self.health {
                        health.record_error(err.to_string());
                    }
                }
            }

            tokio::select! {
                _ = shutdown.wait() => {}
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!(cursor = ?self.cursor, "Synchronizer stopped");
        Ok(())
    }

    async fn persist(&self, block: u64) {
        let service = self.config.service.as_str();
        let saved = Retry::spawn(retry_strategy(), || async {
            self.cursors
                .save_cursor(service, block)
                .await
                .inspect_err(|err| warn!(error = ?err, "Retrying save_cursor"))
        })
        .await;

        if let Err(err) = saved {
            error!(block, error = ?err, "Failed to persist cursor, continuing with in-memory cursor");
        }
    }
}
