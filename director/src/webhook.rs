//! Webhook delivery for async predictions (C7).
//!
//! Implements the cog webhook protocol inherited from the Python original
//! (`webhook.py`): throttling between non-terminal updates, exponential
//! backoff for terminal deliveries, `WEBHOOK_AUTH_TOKEN` bearer auth, and an
//! events filter. [`WebhookEmitter`] wraps a [`WebhookSender`] so a
//! [`crate::tracker::Tracker`] can fire-and-forget a response without caring
//! whether delivery is async.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::tracker::{PredictionResponse, PredictionStatus};
use crate::upload::UploadParams;

const DIRECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventType {
    Start,
    Output,
    Logs,
    #[default]
    Completed,
}

impl WebhookEventType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn all() -> HashSet<WebhookEventType> {
        [Self::Start, Self::Output, Self::Logs, Self::Completed]
            .into_iter()
            .collect()
    }

    /// Classifies a response into the webhook event it represents, mirroring
    /// the original's event derivation from which fields changed.
    fn for_response(response: &PredictionResponse) -> WebhookEventType {
        if response.status.is_terminal() {
            WebhookEventType::Completed
        } else if response.status == PredictionStatus::Starting {
            WebhookEventType::Start
        } else if response.output.is_some() {
            WebhookEventType::Output
        } else {
            WebhookEventType::Logs
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub response_interval: Duration,
    pub events_filter: HashSet<WebhookEventType>,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            response_interval: Duration::from_millis(
                std::env::var("COG_THROTTLE_RESPONSE_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|s| (s * 1000.0) as u64)
                    .unwrap_or(500),
            ),
            events_filter: WebhookEventType::all(),
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// The `webhook` field of an inbound prediction message (spec §3).
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

/// W3C trace context, forwarded onto outbound webhooks when the inbound
/// prediction message carried one.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
}

pub struct WebhookSender {
    url: String,
    config: WebhookConfig,
    client: reqwest::Client,
    last_sent: Mutex<Instant>,
    trace_context: TraceContext,
}

impl WebhookSender {
    pub fn new(url: String, config: WebhookConfig) -> Self {
        Self::with_headers(url, config, std::collections::HashMap::new())
    }

    /// `extra_headers` come from the inbound prediction message's
    /// `webhook.headers` field (spec §4.7 factory signature
    /// `(url, headers, upload_caller?)`).
    pub fn with_headers(
        url: String,
        config: WebhookConfig,
        extra_headers: std::collections::HashMap<String, String>,
    ) -> Self {
        Self::with_trace_context(url, config, extra_headers, TraceContext::default())
    }

    pub fn with_trace_context(
        url: String,
        config: WebhookConfig,
        extra_headers: std::collections::HashMap<String, String>,
        trace_context: TraceContext,
    ) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();

        for (name, value) in &extra_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        if let Ok(token) = std::env::var("WEBHOOK_AUTH_TOKEN")
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let user_agent = format!("director/{}", DIRECTOR_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build webhook HTTP client");

        Self {
            url,
            config,
            client,
            last_sent: Mutex::new(Instant::now() - Duration::from_secs(10)),
            trace_context,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn should_send(&self, event: WebhookEventType) -> bool {
        if !self.config.events_filter.contains(&event) {
            return false;
        }
        if event.is_terminal() {
            return true;
        }
        let last = self.last_sent.lock().unwrap();
        last.elapsed() >= self.config.response_interval
    }

    fn update_last_sent(&self) {
        let mut last = self.last_sent.lock().unwrap();
        *last = Instant::now();
    }

    fn build_request(&self, payload: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(ref traceparent) = self.trace_context.traceparent {
            request = request.header("traceparent", traceparent);
        }
        if let Some(ref tracestate) = self.trace_context.tracestate {
            request = request.header("tracestate", tracestate);
        }
        request
    }

    /// Sends a non-terminal webhook, fire-and-forget, honoring throttling.
    pub fn send(&self, event: WebhookEventType, payload: &serde_json::Value) {
        if !self.should_send(event) {
            return;
        }
        let request = self.build_request(payload);
        self.update_last_sent();
        tokio::spawn(async move {
            if let Err(err) = request.send().await {
                tracing::warn!(error = %err, "webhook delivery failed (non-terminal)");
            }
        });
    }

    /// Sends a terminal webhook, retrying on the configured status codes
    /// with exponential backoff until `max_retries` is exhausted.
    pub async fn send_terminal(&self, event: WebhookEventType, payload: &serde_json::Value) {
        if !self.config.events_filter.contains(&event) {
            return;
        }

        let mut attempt = 0;
        loop {
            match self.build_request(payload).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(status, "terminal webhook delivered");
                        return;
                    }
                    if !self.config.retry_status_codes.contains(&status) {
                        tracing::error!(status, "terminal webhook failed, non-retryable status");
                        return;
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(status, attempt, "terminal webhook exhausted retries");
                        return;
                    }
                    let backoff = self.config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(status, attempt, backoff_ms = backoff.as_millis(), "terminal webhook retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(error = %err, attempt, "terminal webhook exhausted retries");
                        return;
                    }
                    let backoff = self.config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(error = %err, attempt, backoff_ms = backoff.as_millis(), "terminal webhook retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Binds a [`WebhookSender`] to the tracker's fire-and-forget `emit`
/// contract: serializes the response, classifies its event type, and
/// dispatches without blocking the caller.
#[derive(Clone)]
pub struct WebhookEmitter {
    sender: Arc<WebhookSender>,
    upload: Option<UploadParams>,
}

impl WebhookEmitter {
    pub fn new(sender: WebhookSender) -> Self {
        Self::with_upload(sender, None)
    }

    pub fn with_upload(sender: WebhookSender, upload: Option<UploadParams>) -> Self {
        Self {
            sender: Arc::new(sender),
            upload,
        }
    }

    pub fn emit(&self, mut response: PredictionResponse) {
        let event = WebhookEventType::for_response(&response);

        // Terminal SUCCEEDED responses with inlined outputs get uploaded to
        // object storage before the webhook is sent (spec §4.7); this
        // requires the async upload call to finish first, so the whole
        // emission moves onto a spawned task rather than firing inline.
        if event.is_terminal()
            && response.status == PredictionStatus::Succeeded
            && self.upload.is_some()
        {
            let sender = self.sender.clone();
            let upload = self.upload.clone().unwrap();
            tokio::spawn(async move {
                if let Some(output) = response.output.take() {
                    let (new_output, elapsed) = crate::upload::upload_output(&upload, output).await;
                    response.output = Some(new_output);
                    let mut metrics = response.metrics.take().unwrap_or_default();
                    metrics.insert(
                        "upload_time".to_string(),
                        serde_json::json!(elapsed.as_secs_f64()),
                    );
                    response.metrics = Some(metrics);
                }
                let payload = match serde_json::to_value(&response) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::error!(error = %err, prediction_id = %response.id, "failed to serialize webhook payload");
                        return;
                    }
                };
                sender.send_terminal(event, &payload).await;
            });
            return;
        }

        let payload = match serde_json::to_value(&response) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, prediction_id = %response.id, "failed to serialize webhook payload");
                return;
            }
        };

        if event.is_terminal() {
            let sender = self.sender.clone();
            tokio::spawn(async move {
                sender.send_terminal(event, &payload).await;
            });
        } else {
            self.sender.send(event, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn config_defaults() {
        let config = WebhookConfig::default();
        assert_eq!(config.response_interval, Duration::from_millis(500));
        assert_eq!(config.max_retries, 12);
        assert!(config.events_filter.contains(&WebhookEventType::Start));
        assert!(config.events_filter.contains(&WebhookEventType::Completed));
    }

    #[test]
    fn event_is_terminal() {
        assert!(!WebhookEventType::Start.is_terminal());
        assert!(!WebhookEventType::Output.is_terminal());
        assert!(!WebhookEventType::Logs.is_terminal());
        assert!(WebhookEventType::Completed.is_terminal());
    }

    fn test_config() -> WebhookConfig {
        WebhookConfig {
            response_interval: Duration::ZERO,
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_terminal_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(url, test_config());
        sender
            .send_terminal(
                WebhookEventType::Completed,
                &serde_json::json!({"id": "pred_123", "status": "succeeded"}),
            )
            .await;
    }

    #[tokio::test]
    async fn send_terminal_retries_on_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(url, test_config());
        sender
            .send_terminal(
                WebhookEventType::Completed,
                &serde_json::json!({"status": "succeeded"}),
            )
            .await;
    }

    #[tokio::test]
    async fn send_terminal_no_retry_on_400() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(url, test_config());
        sender
            .send_terminal(
                WebhookEventType::Completed,
                &serde_json::json!({"status": "succeeded"}),
            )
            .await;
    }

    #[tokio::test]
    async fn send_non_terminal_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let config = WebhookConfig {
            response_interval: Duration::from_secs(10),
            ..test_config()
        };
        let sender = WebhookSender::new(url, config);

        sender.send(WebhookEventType::Output, &serde_json::json!({"output": "1"}));
        sender.send(WebhookEventType::Output, &serde_json::json!({"output": "2"}));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn emitter_dispatches_terminal_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let emitter = WebhookEmitter::new(WebhookSender::new(url, test_config()));

        let mut response = PredictionResponse::new("p1".to_string());
        response.status = PredictionStatus::Succeeded;
        emitter.emit(response);

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn event_classification_follows_status() {
        let starting = PredictionResponse::new("p1".to_string());
        assert_eq!(WebhookEventType::for_response(&starting), WebhookEventType::Start);

        let mut with_output = PredictionResponse::new("p1".to_string());
        with_output.status = PredictionStatus::Processing;
        with_output.output = Some(serde_json::json!(["a"]));
        assert_eq!(WebhookEventType::for_response(&with_output), WebhookEventType::Output);

        let mut terminal = PredictionResponse::new("p1".to_string());
        terminal.status = PredictionStatus::Succeeded;
        assert_eq!(WebhookEventType::for_response(&terminal), WebhookEventType::Completed);
    }
}
