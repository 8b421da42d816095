use async_trait::async_trait;
use creatorlink::{JobContext, JobError, JobHandler, JobKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::{parse_payload, parse_platform, require_http_url, to_result};
use crate::processor::ProcessorClient;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TranscriptPayload {
    pub video_url: String,
    #[serde(default)]
    pub platform: Option<String>,
    /// BCP-47 hint; the processor detects the language when absent
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TranscriptResult {
    pub text: String,
    pub language: String,
    pub segment_count: usize,
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<Value>,
}

/// Extracts a transcript for a video URL.
pub struct TranscriptHandler {
    processor: Arc<ProcessorClient>,
}

impl TranscriptHandler {
    pub fn new(processor: Arc<ProcessorClient>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for TranscriptHandler {
    fn kind(&self) -> JobKind {
        JobKind::Transcript
    }

    async fn handle(&self, ctx: &JobContext, payload: &Value) -> Result<Value, JobError> {
        let mut request: TranscriptPayload = parse_payload(payload)?;
        require_http_url("video_url", &request.video_url)?;
        if let Some(platform) = &request.platform {
            request.platform = Some(parse_platform(platform)?.as_str().to_string());
        }

        let response: TranscriptResponse = self.processor.post("transcripts", &request, None).await?;

        let result = TranscriptResult {
            language: response
                .language
                .or(request.language)
                .unwrap_or_else(|| "und".to_string()),
            segment_count: response.segments.len(),
            text: response.text,
        };

        info!(
            job_id = %ctx.job_id,
            segments = result.segment_count,
            language = %result.language,
            "Transcript extracted"
        );
        to_result(&result)
    }
}
