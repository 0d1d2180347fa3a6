use crate::error::{Error, Result};
use crate::realtime::{ChangeCallback, SubscriptionId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::warn;

pub mod backend;
pub mod query;
pub mod rest;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use backend::BackendGateway;
pub use query::{Collection, CollectionQuery, Filter};
pub use rest::RestClient;

/// The only surface the sync core depends on: reads, counts, single-record
/// patches, and change subscriptions against the hosted backend.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch the rows matching a query. Fails with `Error::Transport`.
    async fn fetch_collection(&self, query: &CollectionQuery) -> Result<Vec<serde_json::Value>>;

    /// Exact number of rows matching a query, without a body.
    async fn count(&self, query: &CollectionQuery) -> Result<u64>;

    /// Partially update one record. Fails with `Error::Transport` or `Error::Rejected`.
    async fn patch_entity(&self, collection: Collection, id: &str, fields: serde_json::Value) -> Result<()>;

    async fn subscribe(&self, collection: Collection, on_change: ChangeCallback) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()>;
}

/// Fetch and decode rows. A row that does not decode makes the whole response
/// malformed.
pub async fn fetch_typed<T: DeserializeOwned>(gateway: &dyn Gateway, query: &CollectionQuery) -> Result<Vec<T>> {
    let rows = gateway.fetch_collection(query).await?;
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|e| {
                warn!("Malformed {} row: {}", query.collection, e);
                Error::Transport(format!("Malformed {} response: {}", query.collection, e))
            })
        })
        .collect()
}
