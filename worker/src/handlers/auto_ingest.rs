use async_trait::async_trait;
use chrono::{DateTime, Utc};
use creatorlink::accounts::AccountStore;
use creatorlink::identity;
use creatorlink::{ConnectorRegistry, JobContext, JobError, JobHandler, JobKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::{parse_payload, parse_platform, to_result};
use crate::processor::ProcessorClient;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AutoIngestPayload {
    pub platform: String,
    pub handle: String,
    /// Only ingest items published after this instant
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AutoIngestResult {
    pub items_ingested: u64,
    /// Resume point for the next run
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    platform: &'a str,
    handle: &'a str,
    platform_user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<DateTime<Utc>>,
}

/// Pulls recent content for a handle using the owner's connected account.
///
/// The stored token is refreshed first when it is about to expire, and the
/// refreshed profile replaces the stored one.
pub struct AutoIngestHandler {
    processor: Arc<ProcessorClient>,
    accounts: Arc<AccountStore>,
    connectors: Arc<ConnectorRegistry>,
}

impl AutoIngestHandler {
    pub fn new(
        processor: Arc<ProcessorClient>,
        accounts: Arc<AccountStore>,
        connectors: Arc<ConnectorRegistry>,
    ) -> Self {
        Self {
            processor,
            accounts,
            connectors,
        }
    }
}

fn storage_error(e: anyhow::Error) -> JobError {
    JobError::transient("storage", format!("{:#}", e))
}

#[async_trait]
impl JobHandler for AutoIngestHandler {
    fn kind(&self) -> JobKind {
        JobKind::AutoIngest
    }

    async fn handle(&self, ctx: &JobContext, payload: &Value) -> Result<Value, JobError> {
        let request: AutoIngestPayload = parse_payload(payload)?;
        let platform = parse_platform(&request.platform)?;
        let handle = identity::to_handle(&request.handle);
        if handle.is_empty() {
            return Err(JobError::invalid_payload(format!(
                "handle '{}' is empty after normalization",
                request.handle
            )));
        }

        let provider = self.connectors.get(platform.as_str())?;

        let stored = self
            .accounts
            .get(&ctx.owner_id, platform.as_str())
            .map_err(storage_error)?
            .ok_or_else(|| {
                JobError::permanent(
                    "account_not_connected",
                    format!("user {} has not connected {}", ctx.owner_id, platform),
                )
            })?;

        let profile = provider.refresh(&stored).await.map_err(|e| {
            warn!(job_id = %ctx.job_id, platform = %platform, error = %e, "Token refresh failed");
            JobError::from(e)
        })?;
        if profile.access_token != stored.access_token {
            self.accounts
                .save(&ctx.owner_id, &profile)
                .map_err(storage_error)?;
            info!(job_id = %ctx.job_id, platform = %platform, "Stored refreshed token");
        }

        let body = IngestRequest {
            platform: platform.as_str(),
            handle: &handle,
            platform_user_id: &profile.platform_user_id,
            since: request.since,
        };
        let result: AutoIngestResult = self
            .processor
            .post("ingest", &body, Some(&profile.access_token))
            .await?;

        info!(
            job_id = %ctx.job_id,
            platform = %platform,
            handle = %handle,
            items = result.items_ingested,
            "Ingest run finished"
        );
        to_result(&result)
    }
}
