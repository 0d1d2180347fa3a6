use crate::error::Result;
use crate::gateway::query::{Collection, CollectionQuery};
use crate::gateway::rest::RestClient;
use crate::gateway::Gateway;
use crate::realtime::{ChangeCallback, ChangeEvent, ChangeFeed, ChangeKind, SubscriptionId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Gateway to the hosted backend: REST surface for reads and writes, a change
/// feed for push notifications. Committed writes are announced on the feed so
/// that other instances refetch.
pub struct BackendGateway {
    rest: RestClient,
    feed: Arc<dyn ChangeFeed>,
}

impl BackendGateway {
    pub fn new(rest: RestClient, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { rest, feed }
    }
}

#[async_trait]
impl Gateway for BackendGateway {
    async fn fetch_collection(&self, query: &CollectionQuery) -> Result<Vec<serde_json::Value>> {
        self.rest.select(query).await
    }

    async fn count(&self, query: &CollectionQuery) -> Result<u64> {
        self.rest.count(query).await
    }

    async fn patch_entity(&self, collection: Collection, id: &str, fields: serde_json::Value) -> Result<()> {
        self.rest.patch(collection, id, &fields).await?;

        let mut record = fields;
        if let Some(record) = record.as_object_mut() {
            record.insert("id".to_string(), serde_json::Value::String(id.to_string()));
        }
        // The write stands even if nobody hears about it
        if let Err(e) = self.feed.announce(ChangeEvent::new(collection, ChangeKind::Update, record)).await {
            warn!("Failed to announce {} change of {}: {}", collection, id, e);
        }
        Ok(())
    }

    async fn subscribe(&self, collection: Collection, on_change: ChangeCallback) -> Result<SubscriptionId> {
        self.feed.subscribe(collection, on_change).await
    }

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()> {
        self.feed.unsubscribe(subscription_id).await
    }
}
