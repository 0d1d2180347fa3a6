use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::gateway::{fetch_typed, Collection, CollectionQuery, Filter, Gateway};
use crate::models::incident_models::{self, LEGACY_RESOLVED_STATUS};
use crate::models::{Camera, Incident, User};
use crate::sync::cache::{QueryCache, QueryKey, Snapshot};
use crate::sync::mutator::{IncidentResolver, ResolveOutcome};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Every incident, newest first
pub const INCIDENTS: QueryKey = QueryKey::from_static("incidents");
/// Incidents still awaiting an operator
pub const UNRESOLVED_INCIDENTS: QueryKey = QueryKey::from_static("incidents:unresolved");
pub const CAMERAS: QueryKey = QueryKey::from_static("cameras");
pub const CURRENT_USER: QueryKey = QueryKey::from_static("users:current");

const EVENT_CAPACITY: usize = 64;
/// Refetches lose to concurrent writes at most this many times before giving up
const MAX_REFETCH_ATTEMPTS: usize = 5;

/// Result of a read-through load. A failed fetch still yields rows: the
/// previous (stale) snapshot if there is one, otherwise an empty list.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub rows: Snapshot<T>,
    pub error: Option<Error>,
}

impl<T> Loaded<T> {
    fn fresh(rows: Snapshot<T>) -> Self {
        Self { rows, error: None }
    }
}

/// Store changes broadcast to interested views
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    IncidentsUpdated { key: String },
    LoadFailed { key: String, message: String },
    Resolved { incident_id: String, outcome: ResolveOutcome },
    ResolveFailed { incident_id: String, message: String },
}

/// Owns the query caches, the shared incident resolver and the refetch paths.
/// One store serves every view of the process.
pub struct DashboardStore {
    gateway: Arc<dyn Gateway>,
    incidents: Arc<QueryCache<Incident>>,
    cameras: QueryCache<Camera>,
    users: QueryCache<User>,
    resolver: Arc<IncidentResolver>,
    events: broadcast::Sender<StoreEvent>,
    settings: SyncConfig,
}

/// Backend query behind an incident cache key
pub fn incident_query(key: &QueryKey) -> Option<CollectionQuery> {
    let all = CollectionQuery::new(Collection::Incidents)
        .select("*")
        .embed("camera", Collection::Cameras)
        .order_desc("ts_start");

    if *key == INCIDENTS {
        Some(all)
    } else if *key == UNRESOLVED_INCIDENTS {
        Some(all.eq("resolved", false))
    } else {
        None
    }
}

fn cameras_query() -> CollectionQuery {
    CollectionQuery::new(Collection::Cameras)
        .select("*")
        .order_asc("name")
}

fn current_user_query() -> CollectionQuery {
    CollectionQuery::new(Collection::Users).select("*").limit(1)
}

// Legacy rows only carry `status = resolved`
fn resolved_count_query() -> CollectionQuery {
    CollectionQuery::new(Collection::Incidents)
        .select("id")
        .filter(Filter::Or(vec![
            Filter::Is("resolved".to_string(), "true".to_string()),
            Filter::Eq("status".to_string(), LEGACY_RESOLVED_STATUS.to_string()),
        ]))
}

impl DashboardStore {
    pub fn new(gateway: Arc<dyn Gateway>, settings: SyncConfig) -> Self {
        let incidents = Arc::new(QueryCache::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let resolver = {
            let events = events.clone();
            IncidentResolver::new(incidents.clone(), gateway.clone()).with_listener(Arc::new(move |key: &QueryKey| {
                let _ = events.send(StoreEvent::IncidentsUpdated { key: key.to_string() });
            }))
        };
        let resolver = Arc::new(resolver);

        Self {
            gateway,
            incidents,
            cameras: QueryCache::new(),
            users: QueryCache::new(),
            resolver,
            events,
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn resolver(&self) -> &Arc<IncidentResolver> {
        &self.resolver
    }

    pub fn incident_cache(&self) -> &Arc<QueryCache<Incident>> {
        &self.incidents
    }

    /// Current snapshot under `key` without touching the backend
    pub fn cached_incidents(&self, key: &QueryKey) -> Option<Snapshot<Incident>> {
        self.incidents.read(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn load_failed(&self, key: &QueryKey, err: &Error) {
        error!("Failed to load {}: {}", key, err);
        self.emit(StoreEvent::LoadFailed {
            key: key.to_string(),
            message: err.to_string(),
        });
    }

    async fn read_through<T>(&self, cache: &QueryCache<T>, key: &QueryKey, query: CollectionQuery) -> Loaded<T>
    where
        T: Clone + DeserializeOwned,
    {
        if let Some(rows) = cache.read(key).filter(|_| !cache.is_stale(key)) {
            return Loaded::fresh(rows);
        }

        match fetch_typed::<T>(self.gateway.as_ref(), &query).await {
            Ok(rows) => {
                debug!("Loaded {} {} rows", rows.len(), key);
                cache.write(key, rows);
                Loaded::fresh(cache.read(key).unwrap_or_default())
            }
            Err(e) => {
                self.load_failed(key, &e);
                Loaded {
                    rows: cache.read(key).unwrap_or_default(),
                    error: Some(e),
                }
            }
        }
    }

    /// Cached incidents under `key`, fetching them if absent or stale.
    pub async fn incidents(&self, key: &QueryKey) -> Result<Loaded<Incident>> {
        if let Some(rows) = self.incidents.read(key).filter(|_| !self.incidents.is_stale(key)) {
            return Ok(Loaded::fresh(rows));
        }

        match self.refetch_incidents(key).await {
            Ok(rows) => Ok(Loaded::fresh(rows)),
            Err(e @ Error::NotFound(_)) => Err(e),
            Err(e) => Ok(Loaded {
                rows: self.incidents.read(key).unwrap_or_default(),
                error: Some(e),
            }),
        }
    }

    /// Fetch `key` from the backend and replace its cached snapshot.
    ///
    /// The result is only written if no resolution started while the fetch
    /// was out and nothing else wrote the key meanwhile; otherwise the fetch
    /// may predate a committed resolution and is retried.
    pub async fn refetch_incidents(&self, key: &QueryKey) -> Result<Snapshot<Incident>> {
        let query = incident_query(key)
            .ok_or_else(|| Error::NotFound(format!("Unknown incident query: {}", key)))?;

        for attempt in 1..=MAX_REFETCH_ATTEMPTS {
            self.resolver.wait_idle().await;
            let before = self.resolver.activity();
            if before.in_flight > 0 {
                continue;
            }
            let version = self.incidents.version(key);

            let mut rows = match fetch_typed::<Incident>(self.gateway.as_ref(), &query).await {
                Ok(rows) => rows,
                Err(e) => {
                    self.load_failed(key, &e);
                    return Err(e);
                }
            };

            if *key == UNRESOLVED_INCIDENTS {
                // Rows resolved through the legacy status column still match `resolved=eq.false`
                rows.retain(|incident| !incident.is_resolved());
            }
            for incident in rows.iter().filter(|incident| !incident.has_valid_window()) {
                warn!(
                    "Incident {} ends before it starts ({} < {})",
                    incident.id, incident.ts_end, incident.ts_start
                );
            }

            if self.resolver.activity().started != before.started {
                debug!("Resolution started during fetch of {}, refetching (attempt {})", key, attempt);
                continue;
            }
            let count = rows.len();
            if self.incidents.write_if_version(key, version, rows).is_none() {
                debug!("{} was written during fetch, refetching (attempt {})", key, attempt);
                continue;
            }

            debug!("Fetched {} incidents for {}", count, key);
            self.emit(StoreEvent::IncidentsUpdated { key: key.to_string() });
            return Ok(self.incidents.read(key).unwrap_or_default());
        }

        warn!("Gave up refetching {} after {} attempts", key, MAX_REFETCH_ATTEMPTS);
        Err(Error::Service(format!(
            "{} kept changing during refetch, gave up after {} attempts",
            key, MAX_REFETCH_ATTEMPTS
        )))
    }

    /// Invalidate and refetch every incident query currently cached. Returns
    /// how many queries were refreshed.
    pub async fn refresh_incidents(&self) -> usize {
        let mut refreshed = 0;
        for key in self.incidents.keys() {
            self.incidents.invalidate(&key);
            if self.refetch_incidents(&key).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    pub async fn cameras(&self) -> Loaded<Camera> {
        self.read_through(&self.cameras, &CAMERAS, cameras_query()).await
    }

    /// The signed-in operator, if the backend returned one
    pub async fn current_user(&self) -> Result<Option<User>> {
        let loaded = self
            .read_through(&self.users, &CURRENT_USER, current_user_query())
            .await;
        match (loaded.rows.first(), loaded.error) {
            (Some(user), _) => Ok(Some(user.clone())),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(None),
        }
    }

    /// Number of resolved incidents, counted by the backend
    pub async fn resolved_count(&self) -> Result<u64> {
        self.gateway.count(&resolved_count_query()).await.map_err(|e| {
            error!("Failed to count resolved incidents: {}", e);
            e
        })
    }

    /// Incidents recorded by one camera, derived from the full incident list
    pub async fn incidents_for_camera(&self, camera_id: &str) -> Result<Loaded<Incident>> {
        let loaded = self.incidents(&INCIDENTS).await?;
        Ok(Loaded {
            rows: Arc::new(
                incident_models::for_camera(&loaded.rows, camera_id)
                    .into_iter()
                    .cloned()
                    .collect(),
            ),
            error: loaded.error,
        })
    }

    /// Resolve an incident on a task of its own so that the attempt settles
    /// even if the caller stops waiting. Every cached list holding the
    /// incident shows the optimistic state.
    pub fn resolve_incident(self: &Arc<Self>, incident_id: &str) -> JoinHandle<Result<ResolveOutcome>> {
        let store = self.clone();
        let incident_id = incident_id.to_string();

        tokio::spawn(async move {
            let keys = store.incidents.keys();
            let result = store.resolver.resolve(&keys, &incident_id).await;
            store.settle(&incident_id, &result).await;
            result
        })
    }

    async fn settle(&self, incident_id: &str, result: &Result<ResolveOutcome>) {
        match result {
            Ok(outcome) => {
                info!("Resolution of {} settled: {:?}", incident_id, outcome);
                self.emit(StoreEvent::Resolved {
                    incident_id: incident_id.to_string(),
                    outcome: *outcome,
                });
            }
            Err(e) => {
                self.emit(StoreEvent::ResolveFailed {
                    incident_id: incident_id.to_string(),
                    message: e.to_string(),
                });
            }
        }

        let attempted = matches!(result, Ok(ResolveOutcome::Resolved)) || matches!(result, Err(e) if e.is_recoverable());
        if self.settings.refetch_on_settle && attempted {
            self.refresh_incidents().await;
        }
    }
}
