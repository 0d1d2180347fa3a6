use crate::error::{Error, Result};
use crate::sync::mutator::ResolveOutcome;
use crate::sync::store::DashboardStore;
use crate::sync::subscription::RealtimeSubscription;
use log::debug;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of a resolution requested by this view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Resolved { incident_id: String, outcome: ResolveOutcome },
    ResolveFailed { incident_id: String, message: String },
}

/// One consuming view: its realtime subscription and the notices for the
/// resolutions it started. Once torn down, results of attempts still in
/// flight are dropped; the attempts themselves run to completion.
pub struct ViewSession {
    store: Arc<DashboardStore>,
    realtime: Option<RealtimeSubscription>,
    cancel: CancellationToken,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ViewSession {
    pub async fn attach(
        store: Arc<DashboardStore>,
        live: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>)> {
        let realtime = if live {
            Some(RealtimeSubscription::open(store.clone()).await?)
        } else {
            None
        };
        let (notices, receiver) = mpsc::unbounded_channel();

        Ok((
            Self {
                store,
                realtime,
                cancel: CancellationToken::new(),
                notices,
            },
            receiver,
        ))
    }

    pub fn resolve(&self, incident_id: &str) -> JoinHandle<()> {
        let attempt = self.store.resolve_incident(incident_id);
        let cancel = self.cancel.clone();
        let notices = self.notices.clone();
        let incident_id = incident_id.to_string();

        tokio::spawn(async move {
            let result = attempt
                .await
                .unwrap_or_else(|e| Err(Error::Internal(e.to_string())));

            if cancel.is_cancelled() {
                debug!("View gone, discarding result for incident {}", incident_id);
                return;
            }

            let notice = match result {
                Ok(outcome) => Notice::Resolved { incident_id, outcome },
                Err(e) => Notice::ResolveFailed {
                    incident_id,
                    message: e.to_string(),
                },
            };
            let _ = notices.send(notice);
        })
    }

    /// Detach the view: drop pending notices and release the subscription.
    pub async fn teardown(mut self) -> Result<()> {
        self.cancel.cancel();
        match self.realtime.take() {
            Some(realtime) => realtime.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for ViewSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
