//! The director (C8): orchestration core and lifecycle state machine.
//!
//! Owns every other component, wires the event bus between them, and
//! implements the per-message handling contract in spec §4.8. This module
//! is the transformed repo's largest, mirroring how much of the original
//! `director.py` the coordination logic actually occupies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{self, Event, EventReceiver};
use crate::health::Health;
use crate::healthchecker::Healthchecker;
use crate::ingress::Ingress;
use crate::registrar::Registrar;
use crate::queue::QueueConsumer;
use crate::sidecar::{CreateOutcome, SidecarClient};
use crate::tracker::{PredictionMessage, Tracker};
use crate::webhook::{WebhookConfig, WebhookEmitter, WebhookSender};

const HEALTHCHECK_WAIT: Duration = Duration::from_secs(10);
const CANCEL_WAIT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumeOutcome {
    Aborted,
    Reassigned,
}

/// Shared exit flag; the signal handler only ever stores `true` into it.
#[derive(Clone)]
struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Director {
    config: Config,
    events_rx: EventReceiver,
    healthchecker: Healthchecker,
    ingress: Ingress,
    registrar: Registrar,
    sidecar: SidecarClient,
    queue: QueueConsumer,
    should_exit: ExitFlag,
    failure_count: u32,
    early_exit_guard: CancellationToken,
}

impl Director {
    /// Connects to Redis and binds the ingress socket; does not yet start
    /// any background task (that happens in [`Director::run`]'s setup
    /// phase, matching `CREATED→SETUP`). `early_exit_guard` is the
    /// pre-start signal guard installed by `main`; `setup` cancels it once
    /// this director's own handlers take over, so a single SIGINT/SIGTERM
    /// is never raced between the two.
    pub async fn build(config: Config, early_exit_guard: CancellationToken) -> anyhow::Result<Self> {
        let (events_tx, events_rx) = events::channel();
        let queue = QueueConsumer::connect(&config.redis_url, config.queue.clone()).await?;
        let healthchecker = Healthchecker::spawn(
            format!("{}/health-check", config.sidecar_url),
            events_tx.clone(),
        );
        let ingress = Ingress::new(config.ingress_port, events_tx);
        let registrar = Registrar::new(
            config.report_url.clone(),
            config.worker_id(),
            config.queue.clone(),
        );
        let sidecar = SidecarClient::new(config.sidecar_url.clone());

        Ok(Self {
            config,
            events_rx,
            healthchecker,
            ingress,
            registrar,
            sidecar,
            queue,
            should_exit: ExitFlag::new(),
            failure_count: 0,
            early_exit_guard,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.setup().await?;
        if !self.should_exit.get() {
            self.idle_loop().await;
        }
        self.shutdown().await;
        Ok(())
    }

    fn aborted(&self) -> bool {
        self.should_exit.get() || self.registrar.expired()
    }

    async fn setup(&mut self) -> anyhow::Result<()> {
        install_signal_handlers(self.should_exit.clone());
        // From here on a SIGINT/SIGTERM must route through `should_exit`
        // (graceful ABORT) and never again through `main`'s early `exit(1)`.
        self.early_exit_guard.cancel();
        crate::probe::mark_ready();
        self.ingress.start().await?;
        self.registrar.start();
        self.registrar.report("prepare").await;

        loop {
            if self.should_exit.get() {
                return Ok(());
            }
            match self.events_rx.poll(Duration::from_secs(1)).await {
                Some(Event::Health { health, .. }) => match health {
                    Health::Ready => break,
                    Health::SetupFailed => {
                        self.should_exit.set();
                        return Ok(());
                    }
                    _ => continue,
                },
                Some(Event::Webhook { .. }) | None => continue,
            }
        }

        self.healthchecker.set_interval(READY_HEALTHCHECK_INTERVAL);
        self.registrar.report("idle").await;
        Ok(())
    }

    async fn idle_loop(&mut self) {
        while !self.aborted() {
            self.registrar.reset_switched();
            if let Some(queue) = self.registrar.current_queue().await
                && queue != self.queue.queue()
            {
                self.queue.rebind(queue);
            }

            if self.consume_cycle().await == ConsumeOutcome::Aborted {
                break;
            }
        }
    }

    async fn consume_cycle(&mut self) -> ConsumeOutcome {
        let mut last_activity = Instant::now();
        loop {
            if !self.confirm_model_health().await {
                self.should_exit.set();
                return ConsumeOutcome::Aborted;
            }

            match self.queue.dequeue().await {
                Ok(Some(body)) => {
                    self.handle_message(body).await;
                    last_activity = Instant::now();
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, "queue dequeue failed, connection manager will retry");
                }
            }

            if self.aborted() {
                return ConsumeOutcome::Aborted;
            }
            if self.registrar.switched() {
                return ConsumeOutcome::Reassigned;
            }
            let consume_timeout = self.config.consume_timeout();
            if !consume_timeout.is_zero() && last_activity.elapsed() > consume_timeout {
                return ConsumeOutcome::Reassigned;
            }
        }
    }

    /// The pre-message health confirmation barrier (spec §4.8.4).
    async fn confirm_model_health(&mut self) -> bool {
        self.healthchecker.request_status();
        let deadline = Instant::now() + HEALTHCHECK_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.events_rx.poll(remaining).await {
                Some(Event::Health { health, .. }) => return health == Health::Ready,
                Some(Event::Webhook { .. }) => continue,
                None => return false,
            }
        }
    }

    async fn handle_message(&mut self, body: Vec<u8>) {
        self.registrar.report("busy").await;
        let span = tracing::info_span!("prediction", queue = %self.queue.queue());
        let _enter = span.enter();

        let raw: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, "message body is not valid JSON, dropping");
                let _ = self.queue.ack(&body).await;
                return;
            }
        };
        let message: PredictionMessage = match serde_json::from_value(raw.clone()) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(error = %err, "message body did not match PredictionMessage, dropping");
                let _ = self.queue.ack(&body).await;
                return;
            }
        };

        let emitter = message.webhook.as_ref().map(|target| {
            let sender = WebhookSender::with_headers(
                target.url.clone(),
                WebhookConfig::default(),
                target.headers.clone(),
            );
            WebhookEmitter::with_upload(sender, message.upload.clone())
        });

        let mut tracker = Tracker::new(message.initial_response(), emitter);

        let mut sidecar_body = raw;
        if let serde_json::Value::Object(ref mut map) = sidecar_body {
            map.insert(
                "webhook".to_string(),
                serde_json::Value::String(format!(
                    "http://localhost:{}/webhook",
                    self.config.ingress_port
                )),
            );
        }

        match self.sidecar.create_prediction(&message.id, &sidecar_body).await {
            Err(err) => {
                tracing::error!(error = %err, "failed to reach sidecar for prediction create");
                tracker.fail("Unknown error handling prediction.");
                self.record_failure();
                let _ = self.queue.ack(&body).await;
                self.registrar.report("idle").await;
                return;
            }
            Ok(CreateOutcome::ValidationFailed(msg)) => {
                tracker.fail(format!("Prediction input failed validation: {msg}"));
                self.record_failure();
                let _ = self.queue.ack(&body).await;
                self.registrar.report("idle").await;
                return;
            }
            Ok(CreateOutcome::Rejected { .. }) => {
                tracker.fail("Unknown error handling prediction.");
                self.record_failure();
                let _ = self.queue.ack(&body).await;
                self.registrar.report("idle").await;
                return;
            }
            Ok(CreateOutcome::Accepted) => {}
        }

        tracker.start();
        self.wait_for_completion(&mut tracker, &message.id).await;

        match tracker.status() {
            crate::tracker::PredictionStatus::Failed => self.record_failure(),
            _ => self.record_success(),
        }

        let _ = self.queue.ack(&body).await;
        self.registrar.report("idle").await;
    }

    /// Wait loop A followed by wait loop B (spec §4.8.3 steps 9-11).
    async fn wait_for_completion(&mut self, tracker: &mut Tracker, prediction_id: &str) {
        let predict_timeout = self.config.predict_timeout();
        loop {
            if tracker.is_complete() {
                return;
            }
            match self.events_rx.poll(POLL_INTERVAL).await {
                Some(Event::Webhook { payload }) if payload.id == prediction_id => {
                    tracker.update_from_webhook_payload(payload);
                }
                Some(Event::Webhook { .. }) => {}
                Some(Event::Health { health, .. }) if !health.is_healthy_during_prediction() => {
                    tracker.fail("Model stopped responding during prediction.");
                    self.should_exit.set();
                    return;
                }
                Some(Event::Health { .. }) => {}
                None => {}
            }

            if !predict_timeout.is_zero() && tracker.runtime() > predict_timeout {
                tracker.timed_out();
                if let Err(err) = self.sidecar.cancel_prediction(prediction_id).await {
                    tracing::warn!(error = %err, "cancel request to sidecar failed");
                }
                break;
            }
        }

        // Wait loop B: cancel grace. Only webhook updates are observed;
        // health/abort signals do not interrupt the grace window.
        let deadline = Instant::now() + CANCEL_WAIT;
        while !tracker.is_complete() && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.poll(remaining.min(POLL_INTERVAL)).await {
                Some(Event::Webhook { payload }) if payload.id == prediction_id => {
                    tracker.update_from_webhook_payload(payload);
                }
                _ => {}
            }
        }

        if !tracker.is_complete() {
            tracker.force_cancel();
            tracing::error!("prediction failed to complete after cancelation");
            self.should_exit.set();
        }
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        if self.config.max_failure_count > 0 && self.failure_count > self.config.max_failure_count
        {
            tracing::error!(
                failure_count = self.failure_count,
                "consecutive failure breaker tripped"
            );
            self.should_exit.set();
        }
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.sidecar.shutdown().await {
            tracing::warn!(error = %err, "sidecar shutdown call failed");
        }
        self.registrar.report("shutdown").await;

        // Shutdown hooks run in registration order, each failure logged and
        // swallowed (spec §4.8.1): healthchecker, ingress, registrar.
        self.healthchecker.stop().await;
        self.ingress.stop().await;
        self.registrar.stop().await;
    }
}

fn install_signal_handlers(should_exit: ExitFlag) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        should_exit.set();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_flag_is_single_writer_safe() {
        let flag = ExitFlag::new();
        assert!(!flag.get());
        flag.set();
        assert!(flag.get());
    }
}
