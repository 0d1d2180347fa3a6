use crate::error::Result;
use crate::gateway::Collection;
use crate::realtime::{ChangeCallback, ChangeEvent, SubscriptionId};
use crate::sync::store::DashboardStore;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Live push subscription on the incident collection for one view.
///
/// Every notification, whatever its kind, invalidates and refetches the
/// incident queries currently cached. Notifications are handled one at a
/// time on a worker task, after any pending resolution has settled; a burst
/// that arrives while a refresh runs collapses into a single further one.
pub struct RealtimeSubscription {
    store: Arc<DashboardStore>,
    subscription_id: Option<SubscriptionId>,
    worker: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub async fn open(store: Arc<DashboardStore>) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ChangeEvent>();

        let on_change: ChangeCallback = Arc::new(move |event| {
            sender
                .send(event)
                .map_err(|_| anyhow::anyhow!("Realtime worker is gone"))
        });
        let subscription_id = store
            .gateway()
            .subscribe(Collection::Incidents, on_change)
            .await?;

        let worker_store = store.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                worker_store.resolver().wait_idle().await;
                let mut coalesced = 0;
                while receiver.try_recv().is_ok() {
                    coalesced += 1;
                }
                debug!(
                    "Incident {} change {} (+{} queued), refetching",
                    event.kind, event.id, coalesced
                );
                let refreshed = worker_store.refresh_incidents().await;
                debug!("Refreshed {} incident queries", refreshed);
            }
        });

        info!("Realtime subscription opened: {}", subscription_id);
        Ok(Self {
            store,
            subscription_id: Some(subscription_id),
            worker: Some(worker),
        })
    }

    /// Unsubscribe and stop the worker. No refetch is triggered afterwards.
    pub async fn release(mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        match self.subscription_id.take() {
            Some(id) => {
                self.store.gateway().unsubscribe(&id).await?;
                info!("Realtime subscription released: {}", id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }

        let Some(id) = self.subscription_id.take() else {
            return;
        };
        warn!("Realtime subscription {} dropped without release", id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let gateway = self.store.gateway().clone();
                handle.spawn(async move {
                    if let Err(e) = gateway.unsubscribe(&id).await {
                        warn!("Failed to unsubscribe {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to unsubscribe {}", id),
        }
    }
}
