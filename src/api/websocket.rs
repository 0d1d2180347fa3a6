use crate::api::rest::{AppState, IncidentList};
use crate::sync::{DashboardStore, Loaded, QueryKey, StoreEvent, ViewSession, INCIDENTS, UNRESOLVED_INCIDENTS};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// Commands accepted from the browser
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Resolve { incident_id: String },
    Refresh,
}

// Messages pushed to the browser, besides resolution notices
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Incidents {
        key: String,
        #[serde(flatten)]
        list: IncidentList,
    },
    LoadFailed { key: String, message: String },
    Error { message: String },
}

type Sender = SplitSink<WebSocket, Message>;

pub async fn handle_ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.store))
}

async fn send_json<T: Serialize>(sender: &mut Sender, message: &T) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize websocket message: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text)).await.is_ok()
}

async fn send_incidents(sender: &mut Sender, store: &DashboardStore, key: &QueryKey) -> bool {
    match store.incidents(key).await {
        Ok(loaded) => {
            let message = ServerMessage::Incidents {
                key: key.to_string(),
                list: loaded.into(),
            };
            send_json(sender, &message).await
        }
        Err(e) => {
            send_json(
                sender,
                &ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await
        }
    }
}

// Pushes what the cache holds now, optimistic entries included
async fn send_cached(sender: &mut Sender, store: &DashboardStore, key: String) -> bool {
    let Some(rows) = store.cached_incidents(&QueryKey::new(key.clone())) else {
        return true;
    };
    let message = ServerMessage::Incidents {
        key,
        list: Loaded { rows, error: None }.into(),
    };
    send_json(sender, &message).await
}

// One websocket is one view: it owns a realtime subscription for its lifetime
async fn handle_socket(socket: WebSocket, store: Arc<DashboardStore>) {
    let (session, mut notices) = match ViewSession::attach(store.clone(), true).await {
        Ok(attached) => attached,
        Err(e) => {
            error!("Failed to open view session: {}", e);
            return;
        }
    };
    let mut events = store.subscribe();
    let (mut sender, mut receiver) = socket.split();
    info!("View session opened");

    let mut open = send_incidents(&mut sender, &store, &INCIDENTS).await
        && send_incidents(&mut sender, &store, &UNRESOLVED_INCIDENTS).await;

    while open {
        tokio::select! {
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received text message: {}", text);
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::Resolve { incident_id }) => {
                                // Outcome arrives as a notice
                                let _ = session.resolve(&incident_id);
                            }
                            Ok(ClientCommand::Refresh) => {
                                store.refresh_incidents().await;
                            }
                            Err(e) => {
                                warn!("Invalid command: {}", e);
                                open = send_json(&mut sender, &ServerMessage::Error {
                                    message: format!("Invalid command: {}", e),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => open = false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        open = false;
                    }
                }
            }
            Some(notice) = notices.recv() => {
                open = send_json(&mut sender, &notice).await;
            }
            event = events.recv() => {
                match event {
                    Ok(StoreEvent::IncidentsUpdated { key }) => {
                        open = send_cached(&mut sender, &store, key).await;
                    }
                    Ok(StoreEvent::LoadFailed { key, message }) => {
                        open = send_json(&mut sender, &ServerMessage::LoadFailed { key, message }).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("View lagged behind by {} store events", skipped);
                    }
                    Err(RecvError::Closed) => open = false,
                }
            }
        }
    }

    if let Err(e) = session.teardown().await {
        warn!("Failed to tear down view session: {}", e);
    }
    info!("View session closed");
}
