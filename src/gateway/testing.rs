//! In-memory gateway used by the sync tests.

use crate::error::{Error, Result};
use crate::gateway::query::{Collection, CollectionQuery, Filter};
use crate::gateway::Gateway;
use crate::realtime::{ChangeCallback, ChangeEvent, ChangeFeed, LocalChangeFeed, SubscriptionId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Default)]
pub(crate) struct FakeGateway {
    tables: Mutex<HashMap<Collection, Vec<Value>>>,
    feed: LocalChangeFeed,
    fetches: Mutex<HashMap<Collection, usize>>,
    patches: Mutex<Vec<(Collection, String, Value)>>,
    patch_failures: Mutex<HashMap<String, Error>>,
    held_patches: Mutex<HashMap<String, Arc<Semaphore>>>,
    held_fetches: Mutex<HashMap<Collection, Arc<Semaphore>>>,
    fetch_failure: Mutex<Option<Error>>,
    count_result: Mutex<Option<u64>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, collection: Collection, rows: Vec<Value>) -> Self {
        self.tables.lock().unwrap().insert(collection, rows);
        self
    }

    pub fn set_rows(&self, collection: Collection, rows: Vec<Value>) {
        self.tables.lock().unwrap().insert(collection, rows);
    }

    pub fn rows(&self, collection: Collection) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fetch_count(&self, collection: Collection) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&collection)
            .copied()
            .unwrap_or(0)
    }

    pub fn patches(&self) -> Vec<(Collection, String, Value)> {
        self.patches.lock().unwrap().clone()
    }

    /// Make the next patch of `id` fail with `error`.
    pub fn fail_patch(&self, id: &str, error: Error) {
        self.patch_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), error);
    }

    /// Keep patches of `id` pending until `release_patch` is called.
    pub fn hold_patch(&self, id: &str) {
        self.held_patches
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release_patch(&self, id: &str) {
        if let Some(gate) = self.held_patches.lock().unwrap().get(id) {
            gate.add_permits(1);
        }
    }

    /// Keep fetches of `collection` pending until `release_fetches`. Rows are
    /// read when the fetch starts, so a held fetch returns what the table
    /// held at that point.
    pub fn hold_fetches(&self, collection: Collection) {
        self.held_fetches
            .lock()
            .unwrap()
            .insert(collection, Arc::new(Semaphore::new(0)));
    }

    pub fn release_fetches(&self, collection: Collection) {
        if let Some(gate) = self.held_fetches.lock().unwrap().remove(&collection) {
            gate.add_permits(1);
        }
    }

    pub fn fail_fetches(&self, error: Option<Error>) {
        *self.fetch_failure.lock().unwrap() = error;
    }

    pub fn set_count(&self, count: u64) {
        *self.count_result.lock().unwrap() = Some(count);
    }

    pub async fn publish(&self, event: ChangeEvent) -> usize {
        self.feed.publish(event).await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count().await
    }
}

fn matches_filter(row: &Value, filter: &Filter) -> bool {
    let render = |column: &str| match row.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "null".to_string(),
        Some(other) => other.to_string(),
    };
    match filter {
        Filter::Eq(column, value) | Filter::Is(column, value) => render(column) == *value,
        Filter::Or(filters) => filters.iter().any(|f| matches_filter(row, f)),
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn fetch_collection(&self, query: &CollectionQuery) -> Result<Vec<Value>> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(query.collection)
            .or_default() += 1;

        if let Some(error) = self.fetch_failure.lock().unwrap().clone() {
            return Err(error);
        }

        let rows = self
            .rows(query.collection)
            .into_iter()
            .filter(|row| query.filters().iter().all(|f| matches_filter(row, f)))
            .collect();

        let gate = self.held_fetches.lock().unwrap().get(&query.collection).cloned();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(rows)
    }

    async fn count(&self, query: &CollectionQuery) -> Result<u64> {
        if let Some(count) = *self.count_result.lock().unwrap() {
            return Ok(count);
        }
        Ok(self.fetch_collection(query).await?.len() as u64)
    }

    async fn patch_entity(&self, collection: Collection, id: &str, fields: Value) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((collection, id.to_string(), fields.clone()));

        let gate = self.held_patches.lock().unwrap().get(id).cloned();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
        }

        if let Some(error) = self.patch_failures.lock().unwrap().remove(id) {
            return Err(error);
        }

        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|r| r.get("id").and_then(Value::as_str) == Some(id)))
            .ok_or_else(|| Error::Rejected {
                status: 404,
                message: format!("No {} row with id {}", collection, id),
            })?;
        if let (Some(row), Some(fields)) = (row.as_object_mut(), fields.as_object()) {
            for (k, v) in fields {
                row.insert(k.clone(), v.clone());
            }
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
