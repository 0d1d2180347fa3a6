pub mod cache;
pub mod mutator;
pub mod session;
pub mod store;
pub mod subscription;

pub use cache::{QueryCache, QueryKey, Snapshot};
pub use mutator::{IncidentResolver, ResolveOutcome};
pub use session::{Notice, ViewSession};
pub use store::{DashboardStore, Loaded, StoreEvent, CAMERAS, CURRENT_USER, INCIDENTS, UNRESOLVED_INCIDENTS};
pub use subscription::RealtimeSubscription;
