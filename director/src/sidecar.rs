//! HTTP client for the three calls the director issues to the model-serving
//! sidecar (spec §6). One long-lived client per director lifetime, separate
//! from the webhook and dispatcher clients (spec §9 Design Notes).

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::health::HealthCheckResponse;

const PREDICTION_CREATE_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const CREATE_RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];
const CREATE_MAX_ATTEMPTS: u32 = 3;
const CREATE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("sidecar request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Outcome of a prediction create call the director must branch on (spec
/// §4.8.3 steps 6-7).
pub enum CreateOutcome {
    Accepted,
    ValidationFailed(String),
    Rejected { status: u16, body: String },
}

pub struct SidecarClient {
    base_url: String,
    client: reqwest::Client,
}

impl SidecarClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build sidecar HTTP client");
        Self { base_url, client }
    }

    pub async fn health_check(&self) -> Result<HealthCheckResponse, SidecarError> {
        let response = self
            .client
            .get(format!("{}/health-check", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        Ok(response.json().await?)
    }

    /// `PUT /predictions/{id}` with `Prefer: respond-async`, retried up to 3
    /// times on {429,5xx}.
    pub async fn create_prediction(
        &self,
        id: &str,
        body: &Value,
    ) -> Result<CreateOutcome, SidecarError> {
        let url = format!("{}/predictions/{}", self.base_url, id);
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .put(&url)
                .header("Prefer", "respond-async")
                .timeout(PREDICTION_CREATE_TIMEOUT)
                .json(body)
                .send()
                .await?;

            let status = result.status().as_u16();
            if result.status().is_success() {
                return Ok(CreateOutcome::Accepted);
            }

            if CREATE_RETRY_STATUS_CODES.contains(&status) {
                attempt += 1;
                if attempt < CREATE_MAX_ATTEMPTS {
                    tokio::time::sleep(CREATE_RETRY_BACKOFF * attempt).await;
                    continue;
                }
                let text = result.text().await.unwrap_or_default();
                return Ok(CreateOutcome::Rejected { status, body: text });
            }

            if status == 422 {
                let text = result.text().await.unwrap_or_default();
                return Ok(CreateOutcome::ValidationFailed(text));
            }

            let text = result.text().await.unwrap_or_default();
            return Ok(CreateOutcome::Rejected { status, body: text });
        }
    }

    pub async fn cancel_prediction(&self, id: &str) -> Result<(), SidecarError> {
        let url = format!("{}/predictions/{}/cancel", self.base_url, id);
        self.client
            .post(&url)
            .timeout(CANCEL_TIMEOUT)
            .send()
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), SidecarError> {
        let url = format!("{}/shutdown", self.base_url);
        self.client
            .post(&url)
            .timeout(SHUTDOWN_TIMEOUT)
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn create_prediction_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/predictions/p1"))
            .and(header("Prefer", "respond-async"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let outcome = client
            .create_prediction("p1", &serde_json::json!({"input": {}}))
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Accepted));
    }

    #[tokio::test]
    async fn create_prediction_validation_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/predictions/p1"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let outcome = client
            .create_prediction("p1", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::ValidationFailed(ref msg) if msg == "bad input"));
    }

    #[tokio::test]
    async fn create_prediction_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/predictions/p1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        let outcome = client
            .create_prediction("p1", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn cancel_and_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predictions/p1/cancel"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/shutdown"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = SidecarClient::new(server.uri());
        client.cancel_prediction("p1").await.unwrap();
        client.shutdown().await.unwrap();
    }
}
