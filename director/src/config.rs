//! CLI flags and environment configuration (spec §6; ambient per
//! SPEC_FULL.md §1.3).

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "director", about = "Coordination engine for a Redis-queued prediction sidecar")]
pub struct Config {
    /// Identifies this worker to the dispatcher; generated if unset.
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Redis queue name (also the routing key).
    #[arg(long, env = "QUEUE")]
    pub queue: String,

    /// Idle-to-recheck-queue timeout, in seconds. 0 disables.
    #[arg(long, env = "CONSUME_TIMEOUT", default_value_t = 30)]
    pub consume_timeout: u64,

    /// Per-prediction max runtime, in seconds. 0 disables.
    #[arg(long, env = "PREDICT_TIMEOUT", default_value_t = 1800)]
    pub predict_timeout: u64,

    /// Consecutive failures before aborting. 0 disables the breaker.
    #[arg(long, env = "MAX_FAILURE_COUNT", default_value_t = 5)]
    pub max_failure_count: u32,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    /// Dispatcher base URL. Worker registrar is a no-op if unset.
    #[arg(long, env = "REPORT_URL")]
    pub report_url: Option<String>,

    /// Sidecar base URL (localhost:5000 by the coglet convention).
    #[arg(long, env = "SIDECAR_URL", default_value = "http://localhost:5000")]
    pub sidecar_url: String,

    /// Port the local webhook ingress listens on.
    #[arg(long, env = "INGRESS_PORT", default_value_t = 4900)]
    pub ingress_port: u16,
}

impl Config {
    pub fn consume_timeout(&self) -> Duration {
        Duration::from_secs(self.consume_timeout)
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_secs(self.predict_timeout)
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_flags() {
        let config = Config::parse_from([
            "director",
            "--queue",
            "preds",
            "--redis-url",
            "redis://localhost",
        ]);
        assert_eq!(config.queue, "preds");
        assert_eq!(config.consume_timeout, 30);
        assert_eq!(config.predict_timeout, 1800);
        assert_eq!(config.max_failure_count, 5);
    }

    #[test]
    fn worker_id_generated_when_absent() {
        let config = Config::parse_from([
            "director",
            "--queue",
            "preds",
            "--redis-url",
            "redis://localhost",
        ]);
        assert!(!config.worker_id().is_empty());
    }
}
