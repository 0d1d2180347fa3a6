use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Logical name of a cached query, e.g. `incidents`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Cow<'static, str>);

impl QueryKey {
    pub const fn from_static(key: &'static str) -> Self {
        Self(Cow::Borrowed(key))
    }

    pub fn new(key: impl Into<String>) -> Self {
        Self(Cow::Owned(key.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable copy of a cached collection
pub type Snapshot<T> = Arc<Vec<T>>;

struct CacheEntry<T> {
    rows: Snapshot<T>,
    version: u64,
    stale: bool,
}

/// Result of an in-place change: the state before it and the version it produced
#[derive(Debug, Clone)]
pub struct Modified<T> {
    pub previous: Snapshot<T>,
    pub version: u64,
}

/// Keyed store of the last fetched result of each query. Every operation
/// holds the lock for its whole duration and never across an await, so
/// readers never observe a partial write. Concurrent writers race; the last
/// write wins.
pub struct QueryCache<T> {
    entries: RwLock<HashMap<QueryKey, CacheEntry<T>>>,
}

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

impl<T: Clone> QueryCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entries(&self) -> RwLockReadGuard<'_, HashMap<QueryKey, CacheEntry<T>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<QueryKey, CacheEntry<T>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last snapshot, or `None` if the key was never written
    pub fn read(&self, key: &QueryKey) -> Option<Snapshot<T>> {
        self.entries().get(key).map(|entry| entry.rows.clone())
    }

    /// Replace the snapshot; returns the new version
    pub fn write(&self, key: &QueryKey, rows: Vec<T>) -> u64 {
        self.replace(key, Arc::new(rows))
    }

    fn replace(&self, key: &QueryKey, rows: Snapshot<T>) -> u64 {
        let version = next_version();
        self.entries_mut().insert(
            key.clone(),
            CacheEntry {
                rows,
                version,
                stale: false,
            },
        );
        version
    }

    /// Replace the snapshot only if the key is still at `expected` (`None`
    /// meaning never written). Returns the new version, or `None` if another
    /// write got there first.
    pub fn write_if_version(&self, key: &QueryKey, expected: Option<u64>, rows: Vec<T>) -> Option<u64> {
        let mut entries = self.entries_mut();
        if entries.get(key).map(|entry| entry.version) != expected {
            return None;
        }

        let version = next_version();
        entries.insert(
            key.clone(),
            CacheEntry {
                rows: Arc::new(rows),
                version,
                stale: false,
            },
        );
        Some(version)
    }

    /// Mark stale so the next read-through refetches. Returns false if absent.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        match self.entries_mut().get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Absent keys count as stale
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries().get(key).map_or(true, |entry| entry.stale)
    }

    pub fn version(&self, key: &QueryKey) -> Option<u64> {
        self.entries().get(key).map(|entry| entry.version)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries().keys().cloned().collect()
    }

    /// Apply `change` to a copy of the cached rows and publish it atomically.
    /// `change` returns whether it changed anything; nothing is written if not.
    pub fn modify<F>(&self, key: &QueryKey, change: F) -> Option<Modified<T>>
    where
        F: FnOnce(&mut Vec<T>) -> bool,
    {
        let mut entries = self.entries_mut();
        let entry = entries.get_mut(key)?;

        let mut rows = entry.rows.as_ref().clone();
        if !change(&mut rows) {
            return None;
        }

        let previous = std::mem::replace(&mut entry.rows, Arc::new(rows));
        entry.version = next_version();

        Some(Modified {
            previous,
            version: entry.version,
        })
    }

    /// Put `snapshot` back only if nothing wrote the key since `version`.
    pub fn restore_if_unchanged(&self, key: &QueryKey, version: u64, snapshot: Snapshot<T>) -> bool {
        let mut entries = self.entries_mut();
        match entries.get_mut(key) {
            Some(entry) if entry.version == version => {
                entry.rows = snapshot;
                entry.version = next_version();
                true
            }
            _ => false,
        }
    }
}

impl<T: Clone> Default for QueryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
