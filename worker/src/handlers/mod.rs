//! Concrete job kinds.
//!
//! Each handler validates its payload into a typed struct (bad payloads are
//! permanent `invalid_payload` failures), calls the processing service and
//! returns a typed result serialized back to JSON.

mod auto_ingest;
mod repost_package;
mod transcript;

pub use auto_ingest::{AutoIngestHandler, AutoIngestPayload, AutoIngestResult};
pub use repost_package::{PackageAsset, RepostPackageHandler, RepostPackagePayload, RepostPackageResult};
pub use transcript::{TranscriptHandler, TranscriptPayload, TranscriptResult};

use creatorlink::accounts::AccountStore;
use creatorlink::connectors::Platform;
use creatorlink::{ConnectorRegistry, HandlerRegistry, JobError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::processor::ProcessorClient;

/// Registry with every built-in job kind
pub fn registry(
    processor: Arc<ProcessorClient>,
    accounts: Arc<AccountStore>,
    connectors: Arc<ConnectorRegistry>,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler(Arc::new(TranscriptHandler::new(Arc::clone(&processor))))
        .with_handler(Arc::new(AutoIngestHandler::new(
            Arc::clone(&processor),
            accounts,
            connectors,
        )))
        .with_handler(Arc::new(RepostPackageHandler::new(processor)))
}

pub(crate) fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, JobError> {
    serde_json::from_value(payload.clone()).map_err(|e| JobError::invalid_payload(e.to_string()))
}

pub(crate) fn to_result<T: Serialize>(result: &T) -> Result<Value, JobError> {
    serde_json::to_value(result)
        .map_err(|e| JobError::permanent("invalid_result", e.to_string()))
}

pub(crate) fn parse_platform(value: &str) -> Result<Platform, JobError> {
    Platform::parse(value)
        .ok_or_else(|| JobError::invalid_payload(format!("unsupported platform '{}'", value)))
}

pub(crate) fn require_http_url(field: &str, value: &str) -> Result<(), JobError> {
    let value = value.trim();
    let has_scheme = value.starts_with("https://") || value.starts_with("http://");
    if !has_scheme || value.len() <= "https://".len() {
        return Err(JobError::invalid_payload(format!(
            "{} must be an http(s) URL, got '{}'",
            field, value
        )));
    }
    Ok(())
}
