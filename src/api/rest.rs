use crate::api::websocket::handle_ws_upgrade;
use crate::config::ApiConfig;
use crate::error::Error;
use crate::models::incident_models::{active_count, sort_for_display};
use crate::models::{Camera, Incident, User};
use crate::sync::{DashboardStore, Loaded, QueryKey, ResolveOutcome, INCIDENTS, UNRESOLVED_INCIDENTS};
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DashboardStore>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

/// Incident list as shown to the operator: unresolved first, newest first
#[derive(Debug, Serialize)]
pub struct IncidentList {
    pub incidents: Vec<Incident>,
    pub active: usize,
    /// Set when the list could not be refreshed; `incidents` then holds the
    /// last known rows, possibly none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Loaded<Incident>> for IncidentList {
    fn from(loaded: Loaded<Incident>) -> Self {
        let mut incidents = loaded.rows.as_ref().clone();
        sort_for_display(&mut incidents);
        Self {
            active: active_count(&incidents),
            incidents,
            error: loaded.error.map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CameraList {
    pub cameras: Vec<Camera>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedCount {
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct Resolution {
    pub incident_id: String,
    pub outcome: ResolveOutcome,
}

pub struct RestApi {
    config: ApiConfig,
    store: Arc<DashboardStore>,
}

impl RestApi {
    pub fn new(config: &ApiConfig, store: Arc<DashboardStore>) -> Self {
        Self {
            config: config.clone(),
            store,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            store: Arc::clone(&self.store),
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(false)
            .max_age(Duration::from_secs(3600));

        Router::new()
            // Incident routes
            .route("/api/incidents", get(get_incidents))
            .route("/api/incidents/unresolved", get(get_unresolved_incidents))
            .route("/api/incidents/resolved-count", get(get_resolved_count))
            .route("/api/incidents/:id/resolve", post(resolve_incident))
            // Camera routes
            .route("/api/cameras", get(get_cameras))
            .route("/api/cameras/:id/incidents", get(get_camera_incidents))
            // User routes
            .route("/api/users/current", get(get_current_user))
            // Live view
            .route("/api/ws", get(handle_ws_upgrade))
            .with_state(state)
            .layer(cors)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        info!("API server listening on {}", addr);
        let listener = TcpListener::bind(addr).await?;

        axum::Server::from_tcp(listener.into_std()?)?
            .serve(self.router().into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

async fn incident_list(state: &AppState, key: &QueryKey) -> ApiResult<Json<IncidentList>> {
    let loaded = state.store.incidents(key).await?;
    Ok(Json(loaded.into()))
}

async fn get_incidents(State(state): State<AppState>) -> ApiResult<Json<IncidentList>> {
    incident_list(&state, &INCIDENTS).await
}

async fn get_unresolved_incidents(State(state): State<AppState>) -> ApiResult<Json<IncidentList>> {
    incident_list(&state, &UNRESOLVED_INCIDENTS).await
}

async fn get_resolved_count(State(state): State<AppState>) -> ApiResult<Json<ResolvedCount>> {
    let count = state.store.resolved_count().await?;
    Ok(Json(ResolvedCount { count }))
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Resolution>> {
    info!("Resolve requested for incident {}", id);

    let outcome = state
        .store
        .resolve_incident(&id)
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

    Ok(Json(Resolution {
        incident_id: id,
        outcome,
    }))
}

async fn get_cameras(State(state): State<AppState>) -> Json<CameraList> {
    let loaded = state.store.cameras().await;
    Json(CameraList {
        cameras: loaded.rows.as_ref().clone(),
        error: loaded.error.map(|e| e.to_string()),
    })
}

async fn get_camera_incidents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<IncidentList>> {
    let loaded = state.store.incidents_for_camera(&id).await?;
    Ok(Json(loaded.into()))
}

async fn get_current_user(State(state): State<AppState>) -> ApiResult<Json<User>> {
    let user = state.store.current_user().await?.ok_or_else(|| ApiError {
        message: "No current user".to_string(),
        status: StatusCode::NOT_FOUND.as_u16(),
    })?;

    Ok(Json(user))
}
