//! Fanout message delivery.
//!
//! An exchange broadcasts every published message to all queues bound to it.
//! Queues are durable and uniquely named per pod: messages published while a
//! queue exists but nobody is consuming are kept for its next consumer.
//! Delivery is acknowledged on receipt, so a message handed to a consumer is
//! never redelivered (at-most-once).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::error::{BatchError, Result};
use crate::job::new_activation_id;

#[async_trait]
pub trait FanoutBroker: Send + Sync {
    /// Declare `exchange` and the durable `queue`, bind them, and start consuming.
    async fn subscribe(&self, exchange: &str, queue: &str) -> Result<Subscription>;

    /// Broadcast `body` to every queue bound to `exchange`.
    async fn publish(&self, exchange: &str, body: Vec<u8>) -> Result<()>;
}

enum Inbox {
    Buffered(OwnedMutexGuard<mpsc::UnboundedReceiver<Vec<u8>>>),
    Streamed(mpsc::Receiver<Vec<u8>>),
}

/// Consumer side of a bound queue.
pub struct Subscription {
    queue: String,
    inbox: Inbox,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next message, or `None` once the broker side has gone away.
    pub async fn next_message(&mut self) -> Option<Vec<u8>> {
        match &mut self.inbox {
            Inbox::Buffered(rx) => rx.recv().await,
            Inbox::Streamed(rx) => rx.recv().await,
        }
    }
}

/// A bound in-memory queue. The receiver lives as long as the queue; a
/// consumer only holds its lock, so unread messages survive the consumer.
struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// In-process broker for single-process runs and tests.
#[derive(Default)]
pub struct MemoryBroker {
    exchanges: Mutex<HashMap<String, HashMap<String, MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare and bind a queue without consuming from it yet.
    pub async fn declare_queue(&self, exchange: &str, queue: &str) {
        let mut exchanges = self.exchanges.lock().await;
        exchanges
            .entry(exchange.to_string())
            .or_default()
            .entry(queue.to_string())
            .or_insert_with(MemoryQueue::new);
    }
}

#[async_trait]
impl FanoutBroker for MemoryBroker {
    async fn subscribe(&self, exchange: &str, queue: &str) -> Result<Subscription> {
        let mut exchanges = self.exchanges.lock().await;
        let bound = exchanges
            .entry(exchange.to_string())
            .or_default()
            .entry(queue.to_string())
            .or_insert_with(MemoryQueue::new);

        let rx = Arc::clone(&bound.rx).try_lock_owned().map_err(|_| {
            BatchError::InvalidArgument(format!("queue {} already has a consumer", queue))
        })?;

        Ok(Subscription {
            queue: queue.to_string(),
            inbox: Inbox::Buffered(rx),
        })
    }

    async fn publish(&self, exchange: &str, body: Vec<u8>) -> Result<()> {
        let mut exchanges = self.exchanges.lock().await;
        let queues = exchanges.entry(exchange.to_string()).or_default();
        for (name, queue) in queues.iter() {
            if queue.tx.send(body.clone()).is_err() {
                tracing::warn!(exchange, queue = %name, "Queue receiver closed, message not delivered");
            }
        }
        Ok(())
    }
}

/// Redis Streams backed broker.
///
/// The exchange is a stream; each queue is a consumer group on it, created at
/// the stream's current tail so it sees every message published after binding.
/// Reads use `XREADGROUP ... NOACK`, which acknowledges on delivery.
pub struct RedisStreamBroker {
    client: redis::Client,
    consumer: String,
    block: Duration,
}

impl RedisStreamBroker {
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            consumer: format!("consumer-{}", new_activation_id()),
            block: Duration::from_millis(1000),
        })
    }
}

#[async_trait]
impl FanoutBroker for RedisStreamBroker {
    async fn subscribe(&self, exchange: &str, queue: &str) -> Result<Subscription> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(exchange, queue, "$").await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let exchange = exchange.to_string();
        let group = queue.to_string();
        let consumer = self.consumer.clone();
        let block_ms = self.block.as_millis() as usize;
        tokio::spawn(async move {
            let opts = StreamReadOptions::default()
                .group(&group, &consumer)
                .count(1)
                .block(block_ms)
                .noack();

            while !tx.is_closed() {
                let reply: redis::RedisResult<Option<StreamReadReply>> =
                    conn.xread_options(&[&exchange], &[">"], &opts).await;
                match reply {
                    Ok(Some(reply)) => {
                        for entry in reply.keys.into_iter().flat_map(|k| k.ids) {
                            let Some(body) = entry.get::<Vec<u8>>("body") else {
                                tracing::warn!(stream = %exchange, id = %entry.id, "Stream entry without body");
                                continue;
                            };
                            if tx.send(body).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(stream = %exchange, group = %group, error = %e, "XREADGROUP failed, retrying");
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                }
            }
        });

        Ok(Subscription {
            queue: queue.to_string(),
            inbox: Inbox::Streamed(rx),
        })
    }

    async fn publish(&self, exchange: &str, body: Vec<u8>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = conn.xadd(exchange, "*", &[("body", body)]).await?;
        Ok(())
    }
}
