use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::Message;
use crate::storage::QueueStore;

/// Handles one message at a time
///
/// The handler owns the outcome: call exactly one [`Acknowledger`] method per
/// message. Returning `Ok` does not complete the message and returning `Err`
/// does not retry it; an unresolved message stays in processing until its
/// processing timeout expires and the sweep returns it to pending.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, ack: Acknowledger) -> anyhow::Result<()>;
}

/// Handles every message of one claim together
///
/// Same outcome contract as [`MessageHandler`], per message in the batch.
#[async_trait]
pub trait BatchMessageHandler: Send + Sync {
    async fn handle_batch(&self, messages: Vec<Message>, ack: Acknowledger) -> anyhow::Result<()>;
}

/// Registered handler kind for a topic
#[derive(Clone)]
pub enum TopicHandler {
    Single(Arc<dyn MessageHandler>),
    Batch(Arc<dyn BatchMessageHandler>),
}

impl std::fmt::Debug for TopicHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicHandler::Single(_) => f.write_str("TopicHandler::Single"),
            TopicHandler::Batch(_) => f.write_str("TopicHandler::Batch"),
        }
    }
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

/// Build a [`MessageHandler`] from `Fn(Message, Acknowledger) -> impl Future`
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message, Acknowledger) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message, Acknowledger) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: Message, ack: Acknowledger) -> anyhow::Result<()> {
        (self.0)(message, ack).await
    }
}

/// Outcome reporting for claimed messages
///
/// Every method moves messages out of processing. Zero matched rows is not
/// an error: the message was most likely reclaimed after its processing
/// timeout and may already be running elsewhere.
#[derive(Clone)]
pub struct Acknowledger {
    store: Arc<dyn QueueStore>,
    topic: Arc<str>,
    retry_delay: Duration,
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("topic", &self.topic)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl Acknowledger {
    pub fn new(store: Arc<dyn QueueStore>, topic: &str, retry_delay: Duration) -> Self {
        Self {
            store,
            topic: Arc::from(topic),
            retry_delay,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Processing → complete
    pub async fn complete(&self, id: i64) -> Result<bool> {
        Ok(self.complete_all(&[id]).await? == 1)
    }

    pub async fn complete_all(&self, ids: &[i64]) -> Result<u64> {
        let affected = self.store.complete(ids).await?;
        self.check("complete", ids, affected);
        Ok(affected)
    }

    /// Processing → dead
    pub async fn dead(&self, id: i64) -> Result<bool> {
        Ok(self.dead_all(&[id]).await? == 1)
    }

    pub async fn dead_all(&self, ids: &[i64]) -> Result<u64> {
        let affected = self.store.dead(ids).await?;
        self.check("dead", ids, affected);
        Ok(affected)
    }

    /// Processing → pending, claimable again immediately
    pub async fn retry(&self, id: i64) -> Result<bool> {
        Ok(self.retry_all(&[id], None).await? == 1)
    }

    /// Processing → invisible for `delay`
    pub async fn retry_after(&self, id: i64, delay: Duration) -> Result<bool> {
        Ok(self.retry_all(&[id], Some(delay)).await? == 1)
    }

    /// Processing → invisible for the topic's configured retry delay
    pub async fn retry_later(&self, id: i64) -> Result<bool> {
        let delay = (!self.retry_delay.is_zero()).then_some(self.retry_delay);
        Ok(self.retry_all(&[id], delay).await? == 1)
    }

    pub async fn retry_all(&self, ids: &[i64], delay: Option<Duration>) -> Result<u64> {
        let affected = self.store.retry(ids, delay).await?;
        self.check("retry", ids, affected);
        Ok(affected)
    }

    /// Remove from processing without keeping any record
    pub async fn delete(&self, id: i64) -> Result<bool> {
        Ok(self.delete_all(&[id]).await? == 1)
    }

    pub async fn delete_all(&self, ids: &[i64]) -> Result<u64> {
        let affected = self.store.delete(ids).await?;
        self.check("delete", ids, affected);
        Ok(affected)
    }

    fn check(&self, outcome: &'static str, ids: &[i64], affected: u64) {
        if affected < ids.len() as u64 {
            warn!(
                topic = %self.topic,
                outcome,
                requested = ids.len(),
                affected,
                ids = ?ids,
                "Outcome matched fewer messages than requested; they may have been reclaimed after timing out"
            );
        } else {
            debug!(topic = %self.topic, outcome, affected, "Outcome recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewMessage, Partition};
    use crate::storage::InMemoryQueueStore;

    async fn claimed(store: &InMemoryQueueStore, count: usize) -> Vec<i64> {
        for i in 0..count {
            store
                .enqueue("t", NewMessage::new(i.to_string()), None)
                .await
                .unwrap();
        }
        store
            .claim("t", count, Duration::from_secs(30))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[tokio::test]
    async fn test_outcomes() {
        let store = Arc::new(InMemoryQueueStore::default());
        let ids = claimed(&store, 5).await;
        let ack = Acknowledger::new(store.clone(), "t", Duration::from_secs(60));

        assert!(ack.complete(ids[0]).await.unwrap());
        assert!(ack.dead(ids[1]).await.unwrap());
        assert!(ack.retry(ids[2]).await.unwrap());
        assert!(ack.retry_later(ids[3]).await.unwrap());
        assert!(ack.delete(ids[4]).await.unwrap());

        assert_eq!(store.partition_of(ids[0]), Some(Partition::Complete));
        assert_eq!(store.partition_of(ids[1]), Some(Partition::Dead));
        assert_eq!(store.partition_of(ids[2]), Some(Partition::Pending));
        assert_eq!(store.partition_of(ids[3]), Some(Partition::Invisible));
        assert_eq!(store.partition_of(ids[4]), None);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_an_error() {
        let store = Arc::new(InMemoryQueueStore::default());
        let ack = Acknowledger::new(store, "t", Duration::from_secs(1));
        assert!(!ack.complete(404).await.unwrap());
        assert_eq!(ack.dead_all(&[404, 405]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_later_without_delay_goes_to_pending() {
        let store = Arc::new(InMemoryQueueStore::default());
        let ids = claimed(&store, 1).await;
        let ack = Acknowledger::new(store.clone(), "t", Duration::ZERO);

        assert!(ack.retry_later(ids[0]).await.unwrap());
        assert_eq!(store.partition_of(ids[0]), Some(Partition::Pending));
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let store = Arc::new(InMemoryQueueStore::default());
        let ids = claimed(&store, 1).await;
        let message = store.get(ids[0]).unwrap();
        let ack = Acknowledger::new(store.clone(), "t", Duration::from_secs(1));

        let handler = handler_fn(|message: Message, ack: Acknowledger| async move {
            ack.complete(message.id).await?;
            Ok(())
        });
        handler.handle(message, ack).await.unwrap();
        assert_eq!(store.partition_of(ids[0]), Some(Partition::Complete));
    }
}
