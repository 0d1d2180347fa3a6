use crate::error::{Error, Result};
use crate::gateway::{Collection, Gateway};
use crate::models::Incident;
use crate::sync::cache::{Modified, QueryCache, QueryKey};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// How a resolution attempt ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// The backend accepted the update; the optimistic state stands
    Resolved,
    /// The cached entry was already resolved; nothing was sent
    AlreadyResolved,
    /// Another attempt for the same incident is still pending; nothing was sent
    AlreadyInFlight,
}

/// Body of the resolution write. Only the boolean flag is ever written.
pub fn resolved_fields() -> serde_json::Value {
    serde_json::json!({ "resolved": true })
}

/// Called with each incident key the resolver writes to
pub type CacheListener = Arc<dyn Fn(&QueryKey) + Send + Sync>;

/// Resolver activity as seen by refetches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    /// Attempts currently pending
    pub in_flight: usize,
    /// Attempts ever started; a change means a speculative write may have landed
    pub started: u64,
}

/// Optimistic resolution of incidents against the incident cache.
///
/// An attempt snapshots every cached list holding the incident, flips
/// `resolved` on the matching entries, and issues the remote write. Success
/// keeps the speculative state; failure puts the snapshots back and hands the
/// error to the caller. The in-flight marker for the incident is cleared
/// however the attempt ends.
pub struct IncidentResolver {
    cache: Arc<QueryCache<Incident>>,
    gateway: Arc<dyn Gateway>,
    in_flight: Mutex<HashSet<String>>,
    activity: watch::Sender<Activity>,
    listener: Option<CacheListener>,
}

/// Clears the in-flight marker on every exit path
struct InFlightGuard<'a> {
    resolver: &'a IncidentResolver,
    incident_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.resolver.finish(&self.incident_id);
    }
}

impl IncidentResolver {
    pub fn new(cache: Arc<QueryCache<Incident>>, gateway: Arc<dyn Gateway>) -> Self {
        let (activity, _) = watch::channel(Activity::default());
        Self {
            cache,
            gateway,
            in_flight: Mutex::new(HashSet::new()),
            activity,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: CacheListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn is_resolving(&self, incident_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(incident_id)
    }

    pub fn pending_count(&self) -> usize {
        self.activity.borrow().in_flight
    }

    pub fn activity(&self) -> Activity {
        *self.activity.borrow()
    }

    /// Wait until no resolution is pending.
    pub async fn wait_idle(&self) {
        let mut activity = self.activity.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed
        let _ = activity.wait_for(|activity| activity.in_flight == 0).await;
    }

    fn begin(&self, incident_id: &str) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(incident_id.to_string());
        if !inserted {
            return None;
        }
        self.activity.send_modify(|activity| {
            activity.in_flight += 1;
            activity.started += 1;
        });
        Some(InFlightGuard {
            resolver: self,
            incident_id: incident_id.to_string(),
        })
    }

    fn finish(&self, incident_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(incident_id);
        self.activity
            .send_modify(|activity| activity.in_flight = activity.in_flight.saturating_sub(1));
    }

    fn notify(&self, key: &QueryKey) {
        if let Some(listener) = &self.listener {
            listener(key);
        }
    }

    /// Resolve `incident_id` in every list under `keys` that holds it.
    pub async fn resolve(&self, keys: &[QueryKey], incident_id: &str) -> Result<ResolveOutcome> {
        let entries = keys
            .iter()
            .filter_map(|key| {
                self.cache
                    .read(key)
                    .and_then(|rows| rows.iter().find(|incident| incident.id == incident_id).cloned())
            })
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return Err(Error::NotFound(format!("Incident {} is not loaded", incident_id)));
        }
        if entries.iter().all(Incident::is_resolved) {
            debug!("Incident {} already resolved", incident_id);
            return Ok(ResolveOutcome::AlreadyResolved);
        }

        let _guard = match self.begin(incident_id) {
            Some(guard) => guard,
            None => {
                debug!("Incident {} already being resolved", incident_id);
                return Ok(ResolveOutcome::AlreadyInFlight);
            }
        };

        let mut speculative = Vec::new();
        for key in keys {
            let modified = self.cache.modify(key, |rows| {
                match rows.iter_mut().find(|incident| incident.id == incident_id) {
                    Some(incident) if !incident.resolved => {
                        incident.mark_resolved();
                        true
                    }
                    _ => false,
                }
            });
            if let Some(modified) = modified {
                self.notify(key);
                speculative.push((key, modified));
            }
        }

        match self
            .gateway
            .patch_entity(Collection::Incidents, incident_id, resolved_fields())
            .await
        {
            Ok(()) => {
                info!("Incident {} resolved", incident_id);
                Ok(ResolveOutcome::Resolved)
            }
            Err(e) => {
                warn!("Failed to resolve incident {}: {}", incident_id, e);
                for (key, modified) in speculative {
                    self.rollback(key, incident_id, modified);
                    self.notify(key);
                }
                Err(e)
            }
        }
    }

    /// Put the pre-attempt snapshot back. If another write landed on the key
    /// since the speculative one, only this incident's entry is reverted, and
    /// only while it still holds the speculative value.
    fn rollback(&self, key: &QueryKey, incident_id: &str, speculative: Modified<Incident>) {
        let Modified { previous, version } = speculative;

        if self.cache.restore_if_unchanged(key, version, previous.clone()) {
            debug!("Restored {} snapshot after failed resolution of {}", key, incident_id);
            return;
        }

        let original = match previous.iter().find(|incident| incident.id == incident_id) {
            Some(original) => original.clone(),
            None => return,
        };
        let mut expected = original.clone();
        expected.mark_resolved();

        let reverted = self.cache.modify(key, |rows| {
            match rows.iter_mut().find(|incident| incident.id == incident_id) {
                Some(incident) if *incident == expected => {
                    *incident = original;
                    true
                }
                _ => false,
            }
        });

        if reverted.is_some() {
            debug!("Reverted incident {} in {} after concurrent writes", incident_id, key);
        } else {
            debug!("Incident {} in {} changed since the attempt, leaving it", incident_id, key);
        }
    }
}
