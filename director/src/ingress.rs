//! Webhook ingress (C3): the local HTTP surface the sidecar calls back into.
//!
//! Every valid `POST /webhook` enqueues a [`crate::events::Event::Webhook`]
//! and returns 200 once enqueued; malformed bodies are rejected with 400 by
//! axum's `Json` extractor before the handler runs. Grounded in the
//! teacher's `transport::http::server` shutdown-signal plumbing, adapted:
//! the director (not the OS) decides when this component stops.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::EventSender;
use crate::tracker::PredictionResponse;

#[derive(Clone)]
struct AppState {
    events: EventSender,
}

async fn webhook_handler(
    State(state): State<AppState>,
    Json(payload): Json<PredictionResponse>,
) -> StatusCode {
    state.events.offer_webhook(payload).await;
    StatusCode::OK
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

fn router(events: EventSender) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { events })
}

/// The local HTTP server (spec §6: port 4900 by convention, configurable
/// here).
pub struct Ingress {
    addr: SocketAddr,
    events: EventSender,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Ingress {
    pub fn new(port: u16, events: EventSender) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            events,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub async fn start(&mut self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let app = router(self.events.clone());
        let cancel = self.cancel.clone();

        self.handle = Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "webhook ingress server exited with error");
            }
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
