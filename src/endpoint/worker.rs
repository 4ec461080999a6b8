use super::manager::GlobalEndpointManager;
use crate::config::EndpointConfig;
use crate::core::{Result, RoutingError};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Background task refreshing the account topology and re-probing
/// unavailable regions.
pub struct TopologyRefreshWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TopologyRefreshWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await.map_err(|err| {
                RoutingError::TransientFetchFailure(format!("topology worker join: {}", err))
            })?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TopologyRefreshWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the worker. It ticks at the shorter of the topology refresh
/// interval and the recheck cooldown, and exits on its own once the manager
/// is dropped.
pub(crate) fn spawn_topology_refresh_worker(
    manager: Weak<GlobalEndpointManager>,
    config: &EndpointConfig,
) -> TopologyRefreshWorker {
    let tick = config
        .topology_refresh_interval_duration()
        .min(config.recheck_cooldown_duration())
        .max(MIN_TICK);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(tick) => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    if manager.topology_refresh_due() {
                        if let Err(err) = manager.refresh_topology().await {
                            event!(Level::WARN, error = %err, "periodic topology refresh failed");
                        }
                    }
                    let rechecked = manager.recheck_due_regions().await;
                    if rechecked > 0 {
                        event!(Level::DEBUG, rechecked, "rechecked unavailable regions");
                    }
                }
            }
        }
    });

    TopologyRefreshWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
