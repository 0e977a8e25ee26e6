//! Worker registrar (C4): reports lifecycle status to an optional remote
//! dispatcher and polls it for queue reassignment or expiration.
//!
//! A no-op when no dispatcher URL is configured (spec §4.4). All remote
//! calls are best-effort: failures are logged and swallowed, never
//! propagated to the director.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NEXT_QUEUE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct NextQueueResponse {
    #[serde(default)]
    queue: Option<String>,
}

struct Shared {
    id: String,
    report_url: String,
    queue: Mutex<String>,
    expired: AtomicBool,
    switched: AtomicBool,
    client: reqwest::Client,
}

/// Tracks and reports this worker's lifecycle to the dispatcher.
pub struct Registrar {
    shared: Option<Arc<Shared>>,
    cancel: CancellationToken,
    poll_task: Option<JoinHandle<()>>,
}

impl Registrar {
    /// `report_url` is the `--report-url` base; `None` makes every
    /// operation a no-op.
    pub fn new(report_url: Option<String>, worker_id: String, queue: String) -> Self {
        let shared = report_url.map(|report_url| {
            Arc::new(Shared {
                id: worker_id,
                report_url,
                queue: Mutex::new(queue),
                expired: AtomicBool::new(false),
                switched: AtomicBool::new(false),
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(5))
                    .build()
                    .expect("failed to build dispatcher HTTP client"),
            })
        });

        Self {
            shared,
            cancel: CancellationToken::new(),
            poll_task: None,
        }
    }

    #[cfg(test)]
    fn is_enabled(&self) -> bool {
        self.shared.is_some()
    }

    /// Starts the periodic `next_queue` poll. No-op if no dispatcher is
    /// configured.
    pub fn start(&mut self) {
        let Some(shared) = self.shared.clone() else {
            return;
        };
        let cancel = self.cancel.clone();
        self.poll_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(NEXT_QUEUE_INTERVAL) => {}
                }
                poll_next_queue(&shared).await;
            }
        }));
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.poll_task.take() {
            let _ = handle.await;
        }
    }

    pub fn expired(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.expired.load(Ordering::SeqCst),
            None => false,
        }
    }

    pub fn switched(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.switched.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Cleared by the main loop at the start of each consume cycle
    /// (spec §3, Worker state).
    pub fn reset_switched(&self) {
        if let Some(shared) = &self.shared {
            shared.switched.store(false, Ordering::SeqCst);
        }
    }

    pub async fn current_queue(&self) -> Option<String> {
        match &self.shared {
            Some(shared) => Some(shared.queue.lock().await.clone()),
            None => None,
        }
    }

    /// Reports a lifecycle status. Spawned as a background task so a slow
    /// or unreachable dispatcher never stalls the director's hot path
    /// (spec §4.4, `worker.py:69-73`); retried once on failure.
    /// `status` must be one of `prepare|idle|busy|shutdown`.
    pub async fn report(&self, status: &str) {
        let Some(shared) = self.shared.clone() else {
            return;
        };
        let status = status.to_string();
        tokio::spawn(async move { send_report(&shared, &status).await });
    }
}

async fn send_report(shared: &Arc<Shared>, status: &str) {
    let url = format!(
        "{}/worker/status/{}?status={}",
        shared.report_url, shared.id, status
    );
    for attempt in 0..2 {
        match shared.client.put(&url).send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                tracing::warn!(status = %response.status(), report_status = status, "dispatcher report rejected");
            }
            Err(err) => {
                tracing::warn!(error = %err, report_status = status, attempt, "dispatcher report failed");
            }
        }
    }
}

async fn poll_next_queue(shared: &Arc<Shared>) {
    let url = format!("{}/worker/next_queue/{}", shared.report_url, shared.id);
    let response = match shared.client.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "dispatcher next_queue poll failed");
            return;
        }
    };

    let body: NextQueueResponse = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(error = %err, "dispatcher next_queue response malformed");
            return;
        }
    };

    match body.queue {
        None => shared.expired.store(true, Ordering::SeqCst),
        Some(new_queue) => {
            let mut current = shared.queue.lock().await;
            if *current != new_queue {
                *current = new_queue;
                shared.switched.store(true, Ordering::SeqCst);
            }
        }
    }
}
