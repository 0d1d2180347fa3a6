use crate::gateway::Collection;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Kind of row-level change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Notification that a row of a collection changed. Consumers treat it as
/// opaque; the record is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub collection: Collection,
    pub kind: ChangeKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(collection: Collection, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection,
            kind,
            timestamp: chrono::Utc::now(),
            record,
        }
    }

    pub fn new_empty(collection: Collection, kind: ChangeKind) -> Self {
        Self::new(collection, kind, serde_json::Value::Null)
    }

    /// Routing key on the change exchange, e.g. `incidents.update`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.collection, self.kind)
    }

    /// Binding pattern matching every change of a collection
    pub fn collection_pattern(collection: Collection) -> String {
        format!("{}.*", collection)
    }
}
