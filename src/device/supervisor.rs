//! Periodic health supervision
//!
//! A background task that scans the registry for instances that were
//! started but whose process has died or whose emulator has stopped
//! answering, emits a structured notification for each and forces a
//! `stop()` so the registry bookkeeping matches reality. Detection
//! latency is bounded by the tick interval; the supervisor itself never
//! fails.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use super::SUPERVISION_INTERVAL_SECS;
use crate::notify::{Notification, NotificationSink};

/// Configuration for the health supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Seconds between liveness scans
    pub interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: SUPERVISION_INTERVAL_SECS,
        }
    }
}

/// Liveness supervisor for all registered device instances
pub struct HealthSupervisor {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn NotificationSink>,
    config: SupervisorConfig,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn NotificationSink>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            sink,
            config,
        }
    }

    /// Run the supervision loop until the shutdown signal flips
    ///
    /// Ticks are sequential: a scan that outlives the interval delays the
    /// next tick rather than overlapping with it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first interval tick fires immediately; skip it so a freshly
        // started instance is not probed before it settles
        ticker.tick().await;

        info!(
            "health supervisor started, interval {}s",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One supervision pass over every started instance
    pub async fn tick(&self) {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return;
        }

        let probes = ids.into_iter().map(|id| {
            let registry = self.registry.clone();
            async move {
                let instance = registry.get(id).ok()?;
                let mut dev = instance.lock().await;
                if !dev.started() {
                    return None;
                }
                let process_alive = dev.is_running();
                let backend_alive = if process_alive {
                    dev.is_backend_alive().await
                } else {
                    false
                };
                if process_alive && backend_alive {
                    return None;
                }

                let details = dev.read_diagnostics();
                let message = if !process_alive {
                    format!("{} process has stopped running", dev.name())
                } else {
                    format!("{} has stopped responding", dev.name())
                };
                warn!("device '{}' [id={}]: {}", dev.name(), id, message);

                // reconcile the bookkeeping; stop never fails on a dead
                // process
                let _ = dev.stop().await;

                Some(Notification::device_stopped(
                    id,
                    dev.name().to_string(),
                    message,
                    details,
                ))
            }
        });

        let mut emitted = 0;
        for notification in join_all(probes).await.into_iter().flatten() {
            self.sink.notify(notification);
            emitted += 1;
        }
        if emitted > 0 {
            debug!("supervision tick emitted {} notification(s)", emitted);
        }
    }
}

/// Spawn the supervisor as a background task
///
/// Returns a shutdown sender used to stop the loop.
pub fn spawn_supervisor(
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn NotificationSink>,
    config: SupervisorConfig,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = HealthSupervisor::new(registry, sink, config);

    tokio::spawn(async move {
        supervisor.run(shutdown_rx).await;
    });

    shutdown_tx
}
