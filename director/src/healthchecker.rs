//! Periodic sidecar health polling (C2).
//!
//! Runs on its own task. Emits a [`crate::events::Event::Health`] only when
//! the observed health changes, or when [`Healthchecker::request_status`]
//! forces an emission — this is the barrier the director's confirm-health
//! step (spec §4.8.4) relies on before every dequeue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::EventSender;
use crate::health::{Health, HealthCheckResponse};

/// Aggressive initial cadence so setup completion is detected fast.
const INITIAL_INTERVAL: Duration = Duration::from_millis(100);

async fn probe_once(client: &reqwest::Client, url: &str) -> Health {
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    let mut attempt = 0u32;
    loop {
        match client.get(url).send().await {
            Ok(response) => match response.json::<HealthCheckResponse>().await {
                Ok(body) => return body.status,
                Err(_) => return Health::Unknown,
            },
            Err(_) => {
                if std::time::Instant::now() >= deadline {
                    return Health::Unknown;
                }
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
            }
        }
    }
}

struct Inner {
    url: String,
    client: reqwest::Client,
    events: EventSender,
    notify: Arc<Notify>,
    interval_rx: watch::Receiver<Duration>,
    cancel: CancellationToken,
}

async fn run(inner: Inner) {
    let mut last_health = Health::Unknown;
    let mut first = true;

    loop {
        let forced = !first
            && tokio::select! {
                _ = inner.notify.notified() => true,
                _ = tokio::time::sleep(*inner.interval_rx.borrow()) => false,
                _ = inner.cancel.cancelled() => return,
            };
        first = false;

        let health = probe_once(&inner.client, &inner.url).await;

        if forced || health != last_health {
            inner.events.offer_health(health, None);
        }
        last_health = health;
    }
}

/// Handle to the spawned healthchecker task.
pub struct Healthchecker {
    notify: Arc<Notify>,
    interval_tx: watch::Sender<Duration>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Healthchecker {
    pub fn spawn(url: String, events: EventSender) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("failed to build healthcheck HTTP client");

        let notify = Arc::new(Notify::new());
        let (interval_tx, interval_rx) = watch::channel(INITIAL_INTERVAL);
        let cancel = CancellationToken::new();

        let inner = Inner {
            url,
            client,
            events,
            notify: notify.clone(),
            interval_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(run(inner));

        Self {
            notify,
            interval_tx,
            cancel,
            handle: Some(handle),
        }
    }

    /// Adjusts the polling cadence. Called by the director when the sidecar
    /// first reports READY (spec §4.8.1: "slows health polling to 5 s").
    pub fn set_interval(&self, interval: Duration) {
        let _ = self.interval_tx.send(interval);
    }

    /// Triggers an immediate out-of-band probe with a forced emission.
    pub fn request_status(&self) {
        self.notify.notify_one();
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::channel;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn emits_on_health_change_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health-check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "READY"})))
            .mount(&server)
            .await;

        let (tx, mut rx) = channel();
        let mut checker = Healthchecker::spawn(format!("{}/health-check", server.uri()), tx);

        let first = rx.poll(Duration::from_millis(500)).await;
        assert!(matches!(
            first,
            Some(crate::events::Event::Health { health: Health::Ready, .. })
        ));

        // No further probes should emit since health hasn't changed, until
        // request_status forces one.
        let coalesced = rx.poll(Duration::from_millis(150)).await;
        assert!(coalesced.is_none());

        checker.request_status();
        let forced = rx.poll(Duration::from_millis(200)).await;
        assert!(matches!(
            forced,
            Some(crate::events::Event::Health { health: Health::Ready, .. })
        ));

        checker.stop().await;
    }
}
