//! Reactive cascade touch driven by the change channel

use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::task::JoinHandle;

use crate::models::{ChangeEvent, ChangeKind};
use crate::service::SyncStore;

/// Listens for record changes and touches the dependents of updated or
/// deleted parents.
///
/// Touch failures are logged and skipped. When the subscriber falls behind
/// the channel it re-touches dependents of everything changed since the last
/// lookup rebuild.
pub struct CascadeSubscriber {
    store: SyncStore,
    events: Receiver<ChangeEvent>,
}

impl CascadeSubscriber {
    /// Subscribe to `store`'s change channel
    pub fn new(store: SyncStore) -> Self {
        let events = store.subscribe();
        Self { store, events }
    }

    /// Run on the tokio runtime until the channel closes
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        loop {
            match self.events.recv().await {
                Ok(event) => self.handle(&event).await,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Cascade subscriber lagged; re-touching recent changes");
                    if let Err(error) = self.store.retouch_recent_changes().await {
                        tracing::warn!(%error, "Failed to re-touch recent changes");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Cascade subscriber stopped");
    }

    async fn handle(&self, event: &ChangeEvent) {
        if event.event == ChangeKind::Insert {
            return;
        }
        let Some(model) = self.store.schema().model_for_table(&event.table) else {
            tracing::debug!(table = %event.table, "Ignoring change on unknown table");
            return;
        };
        if self.store.graph().dependents_of(&model.name).is_empty() {
            return;
        }
        let Some(record_id) = event.record_id() else {
            return;
        };

        if let Err(error) = self.store.cascade_touch(&model.name, record_id).await {
            tracing::warn!(
                record_type = %model.name,
                record_id,
                %error,
                "Cascade touch failed; dependents will be re-sent after the next catch-up"
            );
        }
    }
}
