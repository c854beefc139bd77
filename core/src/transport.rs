//! Event sources
//!
//! The router pulls envelopes from an [`EventSource`] in batches. An empty
//! batch means the source is closed.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tokio::sync::mpsc;

use crate::contract::Subscription;
use crate::envelope::Envelope;
use crate::error::Result;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Register topic subscriptions; may be called again after a failure
    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<()>;

    /// Wait for the next batch; empty when the source is closed
    async fn next_batch(&mut self) -> Result<Vec<Envelope>>;

    async fn close(&mut self) -> Result<()>;
}

/// Channel-backed source for tests and the stdin runner
///
/// Envelopes carrying a `source_topic` that is not subscribed are dropped.
/// Envelopes without a topic are always delivered.
#[derive(Debug)]
pub struct InMemoryEventSource {
    receiver: mpsc::Receiver<Envelope>,
    topics: RwLock<BTreeSet<String>>,
    batch_size: usize,
}

impl InMemoryEventSource {
    /// Source plus the sender that feeds it; dropping every sender closes it
    pub fn channel(capacity: usize) -> (mpsc::Sender<Envelope>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver,
            topics: RwLock::new(BTreeSet::new()),
            batch_size: 32,
        };
        (sender, source)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.read().iter().cloned().collect()
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        match &envelope.context.source_topic {
            None => true,
            Some(topic) => self.topics.read().contains(topic),
        }
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<()> {
        let mut topics = self.topics.write();
        for sub in subscriptions {
            if topics.insert(sub.topic.clone()) {
                tracing::info!(topic = %sub.topic, consumer_group = %sub.consumer_group, "subscribed");
            }
        }
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<Envelope>> {
        loop {
            let Some(first) = self.receiver.recv().await else {
                return Ok(Vec::new());
            };
            let mut batch = Vec::with_capacity(self.batch_size);
            batch.push(first);
            while batch.len() < self.batch_size {
                match self.receiver.try_recv() {
                    Ok(envelope) => batch.push(envelope),
                    Err(_) => break,
                }
            }

            let before = batch.len();
            batch.retain(|e| self.accepts(e));
            if batch.len() < before {
                tracing::debug!(dropped = before - batch.len(), "dropped envelopes for unsubscribed topics");
            }
            // A batch filtered down to nothing is not end of stream
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver.close();
        Ok(())
    }
}
