//! The event bus (C1): a bounded FIFO fusing health updates and sidecar
//! webhook callbacks for the director's main loop to consume.
//!
//! Many producers (the healthchecker, the webhook ingress server), one
//! consumer (the director). Ordering is FIFO across all producers — the bus
//! does not partition by event type (spec.md §4.1).

use std::time::Duration;

use tokio::sync::mpsc;

use crate::health::Health;
use crate::tracker::PredictionResponse;

/// Bus capacity (spec.md §3).
pub const CAPACITY: usize = 128;

/// How long an `offer` for a [`WebhookEvent`] is allowed to retry before
/// giving up and logging a drop. Webhook events must not be silently
/// dropped on overflow; health events may coalesce instead.
const WEBHOOK_BACKPRESSURE_BUDGET: Duration = Duration::from_millis(500);
const WEBHOOK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// A unit of information flowing onto the bus. Modeled as an explicit
/// discriminated union rather than structural typing (spec.md §9).
#[derive(Debug, Clone)]
pub enum Event {
    Health {
        health: Health,
        meta: Option<serde_json::Value>,
    },
    Webhook {
        payload: PredictionResponse,
    },
}

#[derive(Clone)]
pub struct EventSender(mpsc::Sender<Event>);

pub struct EventReceiver(mpsc::Receiver<Event>);

/// Create a bounded event bus with the standard capacity.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (EventSender(tx), EventReceiver(rx))
}

impl EventSender {
    /// Non-blocking offer for a health event. Drops with a warning if the
    /// bus is full — health updates naturally coalesce, so a dropped one is
    /// superseded by the next probe.
    pub fn offer_health(&self, health: Health, meta: Option<serde_json::Value>) {
        let event = Event::Health { health, meta };
        if self.0.try_send(event).is_err() {
            tracing::warn!(?health, "event bus full, dropping health event");
        }
    }

    /// Offer a webhook event, retrying briefly under backpressure. Webhook
    /// callbacks from the sidecar must not be silently dropped; if the
    /// retry budget is exhausted the drop is logged loudly.
    pub async fn offer_webhook(&self, payload: PredictionResponse) {
        let deadline = tokio::time::Instant::now() + WEBHOOK_BACKPRESSURE_BUDGET;
        loop {
            match self.0.try_send(Event::Webhook {
                payload: payload.clone(),
            }) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("event bus closed, dropping webhook event");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::error!(
                            prediction_id = %payload.id,
                            "event bus full, webhook event dropped after backpressure budget exhausted"
                        );
                        return;
                    }
                    tokio::time::sleep(WEBHOOK_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

impl EventReceiver {
    /// Blocking poll with a deadline; returns `None` on timeout ("empty").
    pub async fn poll(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.0.recv())
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::PredictionStatus;

    fn response(id: &str) -> PredictionResponse {
        PredictionResponse {
            id: id.to_string(),
            status: PredictionStatus::Processing,
            ..PredictionResponse::new(id.to_string())
        }
    }

    #[tokio::test]
    async fn fifo_ordering_across_producers() {
        let (tx, mut rx) = channel();
        tx.offer_health(Health::Ready, None);
        tx.offer_webhook(response("p1")).await;
        tx.offer_health(Health::Busy, None);

        let e1 = rx.poll(Duration::from_millis(100)).await.unwrap();
        let e2 = rx.poll(Duration::from_millis(100)).await.unwrap();
        let e3 = rx.poll(Duration::from_millis(100)).await.unwrap();

        assert!(matches!(e1, Event::Health { health: Health::Ready, .. }));
        assert!(matches!(e2, Event::Webhook { .. }));
        assert!(matches!(e3, Event::Health { health: Health::Busy, .. }));
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let (_tx, mut rx) = channel();
        let result = rx.poll(Duration::from_millis(10)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn health_event_drops_when_full() {
        let (tx, _rx) = channel();
        for _ in 0..CAPACITY {
            tx.offer_health(Health::Ready, None);
        }
        // One more push should be silently dropped, not panic or block.
        tx.offer_health(Health::Busy, None);
    }
}
