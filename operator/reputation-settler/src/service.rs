use anyhow::Result;
use market_framework::config::parse_address;
use market_framework::query::QueryHandler;
use market_framework::store::ProviderStore;
use serde::{Deserialize, Serialize};

use crate::engine::SettlementEngine;
use crate::ledger::{JobLedger, ReputationLedger};

pub const REPUTATION_QUERY_SUBJECT: &str = "reputation.query";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRequest {
    pub provider_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationReply {
    pub provider_address: String,
    pub reputation_score: u64,
    pub jobs_completed: u64,
}

/// Answers `reputation.query` straight from the reputation chain.
pub struct ReputationQuery<J, R, S>(pub SettlementEngine<J, R, S>);

impl<J, R, S> QueryHandler for ReputationQuery<J, R, S>
where
    J: JobLedger,
    R: ReputationLedger,
    S: ProviderStore,
{
    type Request = ReputationRequest;
    type Response = ReputationReply;

    async fn answer(&self, request: ReputationRequest) -> Result<ReputationReply> {
        let provider = parse_address(&request.provider_address, "provider address")?;
        let jobs_completed = self.0.jobs_completed(provider).await?;

        Ok(ReputationReply {
            provider_address: provider.to_checksum(None),
            reputation_score: jobs_completed,
            jobs_completed,
        })
    }
}
