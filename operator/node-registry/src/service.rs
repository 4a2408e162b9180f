use anyhow::Result;
use market_framework::query::{NodeFilter, NodesResponse, QueryHandler};
use market_framework::store::ProviderStore;

use crate::registry::LivenessRegistry;

/// Answers `nodes.query` from the active provider listing.
pub struct NodesQuery<S>(pub LivenessRegistry<S>);

impl<S: ProviderStore> QueryHandler for NodesQuery<S> {
    type Request = NodeFilter;
    type Response = NodesResponse;

    async fn answer(&self, filter: NodeFilter) -> Result<NodesResponse> {
        Ok(self.0.list_active_nodes(&filter).await?)
    }
}
