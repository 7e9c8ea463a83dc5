//! Periodic server maintenance

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use wardsync_core::lookup::CascadeSubscriber;
use wardsync_core::util::now_millis;
use wardsync_core::SessionManager;

use crate::config::AppConfig;

/// Handles of the spawned background tasks; aborted on drop
pub struct BackgroundJobs {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundJobs {
    pub fn spawn(sessions: &SessionManager, config: &AppConfig) -> Self {
        let mut handles = vec![CascadeSubscriber::new(sessions.store().clone()).spawn()];

        let maintenance = sessions.clone();
        handles.push(spawn_interval(config.lookup_refresh_interval, move || {
            let sessions = maintenance.clone();
            async move { run_maintenance(&sessions).await }
        }));

        let admission = sessions.clone();
        handles.push(spawn_interval(config.queue_sweep_interval, move || {
            let sessions = admission.clone();
            async move { sweep_admission(&sessions).await }
        }));

        Self { handles }
    }

    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundJobs {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_interval<F, Fut>(period: Duration, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            job().await;
        }
    })
}

/// Fail stale sessions, then fold recent writes into the lookup index
pub async fn run_maintenance(sessions: &SessionManager) {
    if let Err(error) = sessions.sweep_stale_sessions(now_millis()).await {
        tracing::error!(%error, "Stale session sweep failed");
    }
    match sessions.store().refresh_lookup().await {
        Ok(summary) => tracing::debug!(
            upserted = summary.upserted,
            up_to_tick = summary.up_to_tick,
            "Refreshed sync lookup"
        ),
        Err(error) => tracing::error!(%error, "Sync lookup refresh failed"),
    }
}

pub async fn sweep_admission(sessions: &SessionManager) {
    if let Err(error) = sessions.sweep_admission(now_millis()).await {
        tracing::error!(%error, "Admission queue sweep failed");
    }
}
