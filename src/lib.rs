pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod realtime;
pub mod sync;

// Re-export main components for easier use
pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use gateway::{BackendGateway, Gateway, RestClient};
pub use sync::{DashboardStore, IncidentResolver, QueryCache, RealtimeSubscription, ViewSession};
