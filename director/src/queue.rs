//! Redis-backed queue consumer (C5).
//!
//! The spec's broker contract (routing key = queue name, prefetch=1,
//! blocking drain with a 1 s per-iteration timeout, manual ack) does not map
//! onto Redis Streams consumer groups — there is no kombu-style single
//! queue-as-list broker in the `redis` crate. Reliable-queue semantics are
//! built directly on `BRPOPLPUSH`/`LREM`: a message is moved atomically from
//! the queue list to a per-worker processing list on dequeue, and removed
//! from the processing list only once the caller acks it. This gives the
//! same "never drop unacked messages" guarantee (spec §4.5) as a
//! reconnect-safe manual-ack broker would.
//!
//! [`redis::aio::ConnectionManager`] auto-reconnects on transient errors,
//! standing in for the broker's `conn.ensure(...)` retry wrapper the
//! original used.

use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis connection error: {0}")]
    Connection(#[from] redis::RedisError),
}

/// A dequeued message, still unacknowledged until [`QueueConsumer::ack`] is
/// called with its body.
pub struct QueueConsumer {
    manager: redis::aio::ConnectionManager,
    queue: String,
    processing_key: String,
}

impl QueueConsumer {
    pub async fn connect(redis_url: &str, queue: String) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        let processing_key = format!("{queue}:processing");
        Ok(Self {
            manager,
            queue,
            processing_key,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Retarget the consumer at a new queue name, used when the registrar
    /// reports the assignment changed mid-run.
    pub fn rebind(&mut self, queue: String) {
        self.processing_key = format!("{queue}:processing");
        self.queue = queue;
    }

    /// Blocks for up to one second waiting for a message, atomically moving
    /// it onto the processing list. Returns `None` on drain timeout.
    pub async fn dequeue(&mut self) -> Result<Option<Vec<u8>>, QueueError> {
        let body: Option<Vec<u8>> = self
            .manager
            .brpoplpush(&self.queue, &self.processing_key, 1.0)
            .await?;
        Ok(body)
    }

    /// Acknowledges a previously dequeued message, removing it from the
    /// processing list. Called only after the handler returns (spec §4.5:
    /// "the consumer never drops unacked messages on shutdown").
    pub async fn ack(&mut self, body: &[u8]) -> Result<(), QueueError> {
        let _: i64 = self.manager.lrem(&self.processing_key, 1, body).await?;
        Ok(())
    }

    /// Pushes a message directly onto the queue. Exposed for tests and for
    /// tooling that seeds work; the director itself never enqueues.
    pub async fn enqueue_for_test(&mut self, body: &[u8]) -> Result<(), QueueError> {
        let _: i64 = self.manager.lpush(&self.queue, body).await?;
        Ok(())
    }
}
