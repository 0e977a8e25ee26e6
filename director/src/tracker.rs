//! The prediction tracker (C6): per-prediction lifecycle state.
//!
//! A tracker is constructed for exactly one prediction id and never reused
//! (spec.md §4.6, invariant i). Every state-changing operation synchronously
//! hands the current response to the webhook emitter, which itself decides
//! whether to actually send (throttling, terminal bypass).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::webhook::WebhookEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

/// Metrics attached to a terminal response; `upload_time` is populated by
/// the webhook emitter when an upload was performed (spec.md §4.7).
pub type Metrics = std::collections::HashMap<String, serde_json::Value>;

/// The wire shape shared by inbound queue messages, sidecar webhook
/// callbacks, and outbound user webhooks (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_input")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub status: PredictionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

fn default_input() -> serde_json::Value {
    serde_json::json!({})
}

impl PredictionResponse {
    /// A fresh, non-terminal response for a newly-dequeued prediction.
    pub fn new(id: String) -> Self {
        Self {
            id,
            version: None,
            input: default_input(),
            output: None,
            status: PredictionStatus::Starting,
            error: None,
            logs: None,
            created_at: None,
            started_at: None,
            completed_at: None,
            metrics: None,
        }
    }
}

/// The body dequeued from Redis (spec §3). Only the fields the director
/// needs to act on are modeled explicitly; everything else on the wire
/// (arbitrary `PredictionResponse` fields) is forwarded to the sidecar
/// verbatim via the raw JSON the director also keeps around.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionMessage {
    pub id: String,
    #[serde(default)]
    pub webhook: Option<crate::webhook::WebhookTarget>,
    #[serde(default)]
    pub upload: Option<crate::upload::UploadParams>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_input")]
    pub input: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl PredictionMessage {
    /// The initial, non-terminal response for this prediction.
    pub fn initial_response(&self) -> PredictionResponse {
        PredictionResponse {
            version: self.version.clone(),
            input: self.input.clone(),
            created_at: self.created_at.or_else(|| Some(Utc::now())),
            ..PredictionResponse::new(self.id.clone())
        }
    }
}

/// Per-prediction lifecycle tracker. Constructed once per prediction id
/// (spec.md §4.6).
pub struct Tracker {
    response: PredictionResponse,
    timed_out: bool,
    start_instant: Option<Instant>,
    completed_instant: Option<Instant>,
    emitter: Option<WebhookEmitter>,
}

impl Tracker {
    pub fn new(response: PredictionResponse, emitter: Option<WebhookEmitter>) -> Self {
        Self {
            response,
            timed_out: false,
            start_instant: None,
            completed_instant: None,
            emitter,
        }
    }

    pub fn status(&self) -> PredictionStatus {
        self.response.status
    }

    pub fn response(&self) -> &PredictionResponse {
        &self.response
    }

    pub fn is_complete(&self) -> bool {
        self.response.status.is_terminal()
    }

    /// Wall time since [`Tracker::start`], frozen once terminal (invariant
    /// iii).
    pub fn runtime(&self) -> Duration {
        match (self.start_instant, self.completed_instant) {
            (Some(start), Some(completed)) => completed.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }

    /// Marks the prediction as started. Idempotent only on the first call;
    /// a second call is a programming error, not a recoverable one — there
    /// is exactly one call site per prediction (spec.md §4.6).
    pub fn start(&mut self) {
        assert!(
            self.start_instant.is_none(),
            "Tracker::start called more than once for prediction {}",
            self.response.id
        );
        self.start_instant = Some(Instant::now());
        self.response.status = PredictionStatus::Processing;
        self.response.started_at = Some(Utc::now());
        self.emit();
    }

    /// Merges sidecar-reported fields. Ignored once the tracker is already
    /// terminal (invariant ii: terminality is sticky).
    pub fn update_from_webhook_payload(&mut self, payload: PredictionResponse) {
        if self.is_complete() {
            return;
        }

        if let Some(output) = payload.output {
            self.response.output = Some(output);
        }
        if let Some(error) = payload.error {
            self.response.error = Some(error);
        }
        if let Some(logs) = payload.logs {
            self.response.logs = Some(logs);
        }
        if let Some(metrics) = payload.metrics {
            self.response.metrics = Some(metrics);
        }
        self.response.status = payload.status;

        if self.response.status.is_terminal() {
            self.mark_completed();
        }

        // A timeout resolved by the sidecar reporting CANCELED is, from the
        // caller's point of view, a failure: the deadline elapsed before
        // the model ever finished, not a user-initiated cancel.
        if self.timed_out && self.response.status == PredictionStatus::Canceled {
            self.response.status = PredictionStatus::Failed;
            self.response.error = Some(
                "Prediction timed out: model failed to complete within the configured deadline."
                    .to_string(),
            );
        }

        self.emit();
    }

    /// Marks that the predict deadline elapsed. Does not by itself change
    /// status (spec.md §4.6) — it only arms the rewrite in
    /// [`Tracker::update_from_webhook_payload`] and [`Tracker::force_cancel`].
    pub fn timed_out(&mut self) {
        self.timed_out = true;
    }

    /// Forces the prediction to CANCELED, used when cancellation grace
    /// expires without the sidecar ever reporting completion.
    pub fn force_cancel(&mut self) {
        if self.is_complete() {
            return;
        }
        if self.timed_out {
            self.response.status = PredictionStatus::Failed;
            self.response.error = Some(
                "Prediction timed out: model failed to complete within the configured deadline."
                    .to_string(),
            );
        } else {
            self.response.status = PredictionStatus::Canceled;
        }
        self.mark_completed();
        self.emit();
    }

    /// Fails the prediction outright (e.g. the sidecar could not be
    /// reached, or rejected the create request).
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_complete() {
            return;
        }
        self.response.status = PredictionStatus::Failed;
        self.response.error = Some(message.into());
        self.mark_completed();
        self.emit();
    }

    fn mark_completed(&mut self) {
        self.response.completed_at = Some(Utc::now());
        self.completed_instant = Some(Instant::now());
    }

    fn emit(&self) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(self.response.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str) -> PredictionResponse {
        PredictionResponse::new(id.to_string())
    }

    #[test]
    fn start_sets_processing_and_started_at() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        assert_eq!(tracker.status(), PredictionStatus::Processing);
        assert!(tracker.response().started_at.is_some());
    }

    #[test]
    #[should_panic(expected = "called more than once")]
    fn start_twice_panics() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.start();
    }

    #[test]
    fn fail_is_terminal_and_sticky() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.fail("boom");
        assert!(tracker.is_complete());
        assert_eq!(tracker.status(), PredictionStatus::Failed);
        assert_eq!(tracker.response().error.as_deref(), Some("boom"));

        let completed_at = tracker.response().completed_at;
        // A further update must not perturb a completed tracker.
        tracker.update_from_webhook_payload(PredictionResponse {
            status: PredictionStatus::Succeeded,
            ..response("p1")
        });
        assert_eq!(tracker.status(), PredictionStatus::Failed);
        assert_eq!(tracker.response().completed_at, completed_at);
    }

    #[test]
    fn update_advances_status_toward_terminal() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.update_from_webhook_payload(PredictionResponse {
            status: PredictionStatus::Succeeded,
            output: Some(serde_json::json!(["x"])),
            ..response("p1")
        });
        assert!(tracker.is_complete());
        assert_eq!(tracker.status(), PredictionStatus::Succeeded);
        assert_eq!(tracker.response().output, Some(serde_json::json!(["x"])));
    }

    #[test]
    fn timed_out_then_canceled_becomes_failed() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.timed_out();
        tracker.update_from_webhook_payload(PredictionResponse {
            status: PredictionStatus::Canceled,
            ..response("p1")
        });
        assert_eq!(tracker.status(), PredictionStatus::Failed);
        assert!(tracker.response().error.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn force_cancel_without_timeout_is_canceled() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.force_cancel();
        assert_eq!(tracker.status(), PredictionStatus::Canceled);
    }

    #[test]
    fn force_cancel_after_timeout_is_failed() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.timed_out();
        tracker.force_cancel();
        assert_eq!(tracker.status(), PredictionStatus::Failed);
        assert!(tracker.response().error.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn runtime_freezes_after_completion() {
        let mut tracker = Tracker::new(response("p1"), None);
        tracker.start();
        tracker.fail("boom");
        let r1 = tracker.runtime();
        std::thread::sleep(Duration::from_millis(5));
        let r2 = tracker.runtime();
        assert_eq!(r1, r2);
    }

    #[test]
    fn runtime_before_start_is_zero() {
        let tracker = Tracker::new(response("p1"), None);
        assert_eq!(tracker.runtime(), Duration::ZERO);
    }
}
