use crate::error::{Error, Result};
use crate::gateway::Collection;
use crate::realtime::event::ChangeEvent;
use async_trait::async_trait;
use log::{debug, error, info};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Callback invoked for every change notification
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle identifying one live subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Push channel delivering row change notifications
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to every change of a collection
    async fn subscribe(&self, collection: Collection, callback: ChangeCallback) -> Result<SubscriptionId>;

    /// Release a subscription; no callback runs after this returns
    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()>;

    /// Tell every subscriber on the feed about a change made here
    async fn announce(&self, event: ChangeEvent) -> Result<()>;
}

/// In-process change feed. Publishing dispatches synchronously to the
/// callbacks registered for the event's collection.
#[derive(Default)]
pub struct LocalChangeFeed {
    subscriptions: RwLock<HashMap<SubscriptionId, (Collection, ChangeCallback)>>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event; returns how many subscribers received it.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        let subscriptions = self.subscriptions.read().await;
        let mut delivered = 0;

        for (id, (collection, callback)) in subscriptions.iter() {
            if *collection != event.collection {
                continue;
            }
            debug!("Dispatching {} ({}) to {}", event.routing_key(), event.id, id);
            if let Err(e) = callback(event.clone()) {
                error!("Error processing change event: {}", e);
            }
            delivered += 1;
        }

        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&self, collection: Collection, callback: ChangeCallback) -> Result<SubscriptionId> {
        let id = SubscriptionId::generate();
        self.subscriptions
            .write()
            .await
            .insert(id.clone(), (collection, callback));
        info!("Subscribed to {} changes ({})", collection, id);
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()> {
        match self.subscriptions.write().await.remove(subscription_id) {
            Some(_) => {
                info!("Unsubscribed: {}", subscription_id);
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "Subscription not found: {}",
                subscription_id
            ))),
        }
    }

    async fn announce(&self, event: ChangeEvent) -> Result<()> {
        self.publish(event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::ChangeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> ChangeCallback {
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_collection_only() {
        let feed = LocalChangeFeed::new();
        let incidents = Arc::new(AtomicUsize::new(0));
        let cameras = Arc::new(AtomicUsize::new(0));

        feed.subscribe(Collection::Incidents, counting_callback(incidents.clone()))
            .await
            .unwrap();
        feed.subscribe(Collection::Cameras, counting_callback(cameras.clone()))
            .await
            .unwrap();

        let delivered = feed
            .publish(ChangeEvent::new_empty(Collection::Incidents, ChangeKind::Insert))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(incidents.load(Ordering::SeqCst), 1);
        assert_eq!(cameras.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let feed = LocalChangeFeed::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = feed
            .subscribe(Collection::Incidents, counting_callback(counter.clone()))
            .await
            .unwrap();

        feed.unsubscribe(&id).await.unwrap();
        feed.publish(ChangeEvent::new_empty(Collection::Incidents, ChangeKind::Update))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(feed.subscriber_count().await, 0);
        assert!(matches!(feed.unsubscribe(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failing_callback_still_counts_as_delivered() {
        let feed = LocalChangeFeed::new();
        feed.subscribe(
            Collection::Incidents,
            Arc::new(|_event| Err(anyhow::anyhow!("view gone"))),
        )
        .await
        .unwrap();

        let delivered = feed
            .publish(ChangeEvent::new_empty(Collection::Incidents, ChangeKind::Delete))
            .await;
        assert_eq!(delivered, 1);
    }
}
