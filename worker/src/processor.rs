use anyhow::{Context, Result};
use creatorlink::config::ProcessorConfig;
use creatorlink::JobError;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the processing service.
///
/// Every job kind POSTs its request as JSON to `{base_url}/{path}` and reads
/// a JSON result back. Failures come back already classified:
///
/// | failure | class | code |
/// |---|---|---|
/// | timeout | transient | `timeout` |
/// | connection error | transient | `network` |
/// | 429 | transient | `rate_limited` |
/// | 5xx | transient | `upstream_unavailable` |
/// | other 4xx | permanent | `rejected` |
/// | undecodable body | permanent | `invalid_response` |
pub struct ProcessorClient {
    http: Client,
    base_url: String,
}

impl ProcessorClient {
    pub fn new(config: &ProcessorConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent("creatorlink-worker/1.0")
            .build()
            .context("Failed to build processor HTTP client")?;
        Ok(Self::with_client(http, &config.base_url))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// POST `body` to `path`, optionally authenticating with a platform token.
    pub async fn post<B, R>(&self, path: &str, body: &B, bearer: Option<&str>) -> Result<R, JobError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(url = %url, "Calling processor");

        let mut request = self.http.post(&url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                JobError::transient("timeout", format!("processor timed out: {}", e))
            } else {
                JobError::transient("network", format!("processor unreachable: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(classify_status(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| JobError::transient("network", format!("failed to read response: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| JobError::permanent("invalid_response", format!("undecodable response: {}", e)))
    }
}

fn classify_status(status: StatusCode, body: &str) -> JobError {
    let message = format!("processor returned {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        JobError::transient("rate_limited", message)
    } else if status.is_server_error() {
        JobError::transient("upstream_unavailable", message)
    } else {
        JobError::permanent("rejected", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creatorlink::ErrorClass;
    use mockito::{Matcher, Server};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Echo {
        ok: bool,
    }

    fn client(url: &str) -> ProcessorClient {
        let http = Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        ProcessorClient::with_client(http, url)
    }

    #[tokio::test]
    async fn test_post_success_with_bearer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("authorization", "Bearer tok-1")
            .match_body(Matcher::Json(json!({"handle": "@jane"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let result: Echo = client(&format!("{}/", server.url()))
            .post("ingest", &json!({"handle": "@jane"}), Some("tok-1"))
            .await
            .unwrap();

        assert_eq!(result, Echo { ok: true });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_classification() {
        let cases = [
            (429, ErrorClass::Transient, "rate_limited"),
            (503, ErrorClass::Transient, "upstream_unavailable"),
            (422, ErrorClass::Permanent, "rejected"),
            (404, ErrorClass::Permanent, "rejected"),
        ];

        for (status, class, code) in cases {
            let mut server = Server::new_async().await;
            let _mock = server
                .mock("POST", "/transcripts")
                .with_status(status)
                .with_body("nope")
                .create_async()
                .await;

            let err = client(&server.url())
                .post::<_, Echo>("/transcripts", &json!({}), None)
                .await
                .unwrap_err();
            assert_eq!(err.class, class, "status {}", status);
            assert_eq!(err.code, code, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_undecodable_response_is_permanent() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/transcripts")
            .with_status(200)
            .with_body("<html>surprise</html>")
            .create_async()
            .await;

        let err = client(&server.url())
            .post::<_, Echo>("transcripts", &json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_response");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_processor_is_transient() {
        let err = client("http://127.0.0.1:9")
            .post::<_, Echo>("transcripts", &json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
