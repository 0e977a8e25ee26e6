//! Health status reported by the sidecar's `/health-check` endpoint.

use serde::{Deserialize, Serialize};

/// Health status of the model-serving sidecar, as reported by the sidecar
/// itself. Transitions are always reported by the sidecar, never inferred
/// locally by the director (spec.md §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// No healthcheck has completed successfully yet.
    #[default]
    Unknown,
    /// Running setup.
    Starting,
    /// Ready to accept predictions.
    Ready,
    /// Currently serving a prediction.
    Busy,
    /// Setup failed; the sidecar will never become healthy.
    SetupFailed,
}

impl Health {
    /// Healthy states to observe while a prediction is in flight
    /// (spec.md §4.8.3 step 9).
    pub fn is_healthy_during_prediction(&self) -> bool {
        matches!(self, Health::Busy | Health::Ready)
    }
}

/// Body of the sidecar's `GET /health-check` response.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    #[serde(default)]
    pub setup: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_default_is_unknown() {
        assert_eq!(Health::default(), Health::Unknown);
    }

    #[test]
    fn health_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&Health::SetupFailed).unwrap(),
            "\"SETUP_FAILED\""
        );
    }

    #[test]
    fn health_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<Health>("\"READY\"").unwrap(),
            Health::Ready
        );
        assert_eq!(
            serde_json::from_str::<Health>("\"SETUP_FAILED\"").unwrap(),
            Health::SetupFailed
        );
    }

    #[test]
    fn healthy_during_prediction() {
        assert!(Health::Ready.is_healthy_during_prediction());
        assert!(Health::Busy.is_healthy_during_prediction());
        assert!(!Health::Unknown.is_healthy_during_prediction());
        assert!(!Health::Starting.is_healthy_during_prediction());
        assert!(!Health::SetupFailed.is_healthy_during_prediction());
    }

    #[test]
    fn parses_health_check_response_with_setup() {
        let body = r#"{"status": "READY", "setup": {"started_at": "now"}}"#;
        let resp: HealthCheckResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.status, Health::Ready);
        assert!(resp.setup.is_some());
    }
}
