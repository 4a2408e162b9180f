use std::fmt::Debug;
use std::future::Future;

use anyhow::Result;

use crate::error::HandleError;

/// Typed view of one contract on one chain endpoint.
pub trait EventSource: Send + Sync + 'static {
    /// Discriminates the event kinds this source can be asked for.
    type Kind: Copy + Debug + Send + Sync + 'static;
    type Event: Debug + Send + Sync + 'static;

    /// Latest block height the endpoint considers confirmed.
    fn latest_block(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Events of `kind` in the inclusive range, in chain order.
    fn fetch_events(
        &self,
        kind: Self::Kind,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<Vec<Self::Event>>> + Send;
}

/// Consumes decoded chain events.
///
/// [`HandleError::Skip`] drops the event. [`HandleError::Retry`] aborts the
/// pass, and the whole window is handed out again later, so events that
/// were already applied must be safe to see twice.
pub trait EventHandler<E>: Send + Sync + 'static {
    fn handle(&self, event: &E) -> impl Future<Output = Result<(), HandleError>> + Send;
}
