use super::camera_models::Camera;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Value of the legacy `status` column for rows resolved through the old write path.
pub const LEGACY_RESOLVED_STATUS: &str = "resolved";

/// Security incident, optionally with its camera embedded
/// (`select=*,camera:cameras(*)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    #[serde(default)]
    pub camera_id: Option<String>,
    /// Classification tag, e.g. "Suspicious Activity"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Legacy resolution marker; only read, never written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub thumbnail_url: String,
    pub ts_start: DateTime<Utc>,
    pub ts_end: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<Camera>,
}

impl Incident {
    /// Canonical flag, or a row resolved through the legacy `status` column.
    pub fn is_resolved(&self) -> bool {
        self.resolved || self.status.as_deref() == Some(LEGACY_RESOLVED_STATUS)
    }

    /// Speculative resolution: touches `resolved` and nothing else.
    pub fn mark_resolved(&mut self) {
        self.resolved = true;
    }

    /// `ts_end` must not precede `ts_start`.
    pub fn has_valid_window(&self) -> bool {
        self.ts_end >= self.ts_start
    }
}

/// Unresolved first, then newest `ts_start` first.
pub fn display_order(a: &Incident, b: &Incident) -> Ordering {
    a.is_resolved()
        .cmp(&b.is_resolved())
        .then_with(|| b.ts_start.cmp(&a.ts_start))
}

pub fn sort_for_display(incidents: &mut [Incident]) {
    incidents.sort_by(display_order);
}

pub fn active_count(incidents: &[Incident]) -> usize {
    incidents.iter().filter(|i| !i.is_resolved()).count()
}

pub fn for_camera<'a>(incidents: &'a [Incident], camera_id: &str) -> Vec<&'a Incident> {
    incidents
        .iter()
        .filter(|i| i.camera_id.as_deref() == Some(camera_id))
        .collect()
}

#[cfg(test)]
pub(crate) fn sample(id: &str, resolved: bool) -> Incident {
    use chrono::TimeZone;
    let start = Utc.with_ymd_and_hms(2025, 7, 22, 10, 0, 0).unwrap();
    Incident {
        id: id.to_string(),
        camera_id: Some("cam-1".to_string()),
        kind: "Suspicious Activity".to_string(),
        location: None,
        status: None,
        thumbnail_url: format!("/thumbs/{}.jpg", id),
        ts_start: start,
        ts_end: start + chrono::Duration::minutes(2),
        resolved,
        created_at: start,
        camera: None,
    }
}
