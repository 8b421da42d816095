use async_trait::async_trait;
use creatorlink::{JobContext, JobError, JobHandler, JobKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use super::{parse_payload, parse_platform, require_http_url, to_result};
use crate::processor::ProcessorClient;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepostPackagePayload {
    pub source_url: String,
    pub target_platforms: Vec<String>,
    #[serde(default)]
    pub caption_hint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PackageAsset {
    pub platform: String,
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepostPackageResult {
    pub package_id: String,
    pub assets: Vec<PackageAsset>,
}

/// Builds per-platform repost assets from one source post.
pub struct RepostPackageHandler {
    processor: Arc<ProcessorClient>,
}

impl RepostPackageHandler {
    pub fn new(processor: Arc<ProcessorClient>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for RepostPackageHandler {
    fn kind(&self) -> JobKind {
        JobKind::RepostPackage
    }

    async fn handle(&self, ctx: &JobContext, payload: &Value) -> Result<Value, JobError> {
        let mut request: RepostPackagePayload = parse_payload(payload)?;
        require_http_url("source_url", &request.source_url)?;

        // Canonical names, duplicates collapsed
        let targets = request
            .target_platforms
            .iter()
            .map(|p| parse_platform(p).map(|p| p.as_str().to_string()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if targets.is_empty() {
            return Err(JobError::invalid_payload("target_platforms must not be empty"));
        }
        request.target_platforms = targets.into_iter().collect();

        let result: RepostPackageResult = self.processor.post("repost-packages", &request, None).await?;

        let unexpected: Vec<&str> = result
            .assets
            .iter()
            .map(|asset| asset.platform.as_str())
            .filter(|platform| !request.target_platforms.iter().any(|t| t == platform))
            .collect();
        if !unexpected.is_empty() {
            return Err(JobError::permanent(
                "invalid_response",
                format!("assets for platforms that were not requested: {:?}", unexpected),
            ));
        }

        info!(
            job_id = %ctx.job_id,
            package_id = %result.package_id,
            assets = result.assets.len(),
            "Repost package generated"
        );
        to_result(&result)
    }
}
