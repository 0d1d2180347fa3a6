use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera feed as served by the `cameras` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
