use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

pub type DeliveryTag = u64;

/// One message handed to a consumer, outstanding until acked or nacked
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Publish/consume/ack primitives of a message broker.
///
/// Delivery is at-least-once: a message stays unacked until `ack`, and
/// `nack` with `requeue` hands it out again.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Waits for the next ready message; callers bound the wait
    async fn consume(&self, queue: &str) -> Result<Delivery>;

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()>;

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<DeliveryTag, Delivery>,
    dead: Vec<Vec<u8>>,
}

struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

/// In-process broker for tests and single-node deployments
pub struct MemoryBroker {
    queues: parking_lot::Mutex<HashMap<String, Arc<MemoryQueue>>>,
    next_tag: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: parking_lot::Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()))
            .clone()
    }

    fn existing(&self, name: &str) -> Result<Arc<MemoryQueue>> {
        match self.queues.lock().get(name) {
            Some(queue) => Ok(queue.clone()),
            None => bail!("Queue {name} was never declared"),
        }
    }

    /// Removes and returns every ready message of `queue`
    pub async fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let queue = self.queue(queue);
        let mut state = queue.state.lock().await;
        state.ready.drain(..).map(|d| d.body).collect()
    }

    /// Ready plus unacked messages of `queue`
    pub async fn depth(&self, queue: &str) -> usize {
        let queue = self.queue(queue);
        let state = queue.state.lock().await;
        state.ready.len() + state.unacked.len()
    }

    /// Messages dropped by a nack without requeue
    pub async fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        let queue = self.queue(queue);
        queue.state.lock().await.dead.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.queue(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let target = self.queue(queue);
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        target.state.lock().await.ready.push_back(Delivery {
            tag,
            body: body.to_vec(),
            redelivered: false,
        });
        target.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Delivery> {
        let queue = self.queue(queue);
        loop {
            {
                let mut state = queue.state.lock().await;
                if let Some(delivery) = state.ready.pop_front() {
                    state.unacked.insert(delivery.tag, delivery.clone());
                    return Ok(delivery);
                }
            }
            queue.notify.notified().await;
        }
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        let queue_ref = self.existing(queue)?;
        if queue_ref.state.lock().await.unacked.remove(&tag).is_none() {
            bail!("Unknown delivery tag {tag} on {queue}");
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let queue_ref = self.existing(queue)?;
        let mut state = queue_ref.state.lock().await;
        let Some(mut delivery) = state.unacked.remove(&tag) else {
            bail!("Unknown delivery tag {tag} on {queue}");
        };
        if requeue {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
            drop(state);
            queue_ref.notify.notify_one();
        } else {
            state.dead.push(delivery.body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("q").await.unwrap();

        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.consume("q").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish("q", b"hello").await.unwrap();

        let delivery = consumer.await.unwrap();
        assert_eq!(delivery.body, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.depth("q").await, 1);

        broker.ack("q", delivery.tag).await.unwrap();
        assert_eq!(broker.depth("q").await, 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_first() {
        let broker = MemoryBroker::new();
        broker.publish("q", b"a").await.unwrap();
        broker.publish("q", b"b").await.unwrap();

        let first = broker.consume("q").await.unwrap();
        broker.nack("q", first.tag, true).await.unwrap();

        let again = broker.consume("q").await.unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        broker.publish("q", b"poison").await.unwrap();
        let delivery = broker.consume("q").await.unwrap();
        broker.nack("q", delivery.tag, false).await.unwrap();

        assert_eq!(broker.depth("q").await, 0);
        assert_eq!(broker.dead_letters("q").await, vec![b"poison".to_vec()]);
        assert!(broker.ack("q", delivery.tag).await.is_err());
    }
}
