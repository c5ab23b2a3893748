use std::sync::Arc;
use std::time::Duration;

use execgate_agent::AgentRouter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Background task that probes every registered agent on a fixed interval.
pub struct HeartbeatProber {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HeartbeatProber {
    /// The first probe runs immediately so agents become routable without waiting a full
    /// interval.
    pub fn spawn(router: Arc<AgentRouter>, interval: Duration) -> Self {
        let (shutdown, mut signal) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let registered = router.agents().len();
                        let healthy = router.probe_agents().await;
                        debug!(
                            event_name = "system.heartbeat.probed",
                            registered,
                            healthy,
                            "agent heartbeat round finished"
                        );
                    }
                }
            }

            info!(event_name = "system.heartbeat.stopped", "heartbeat prober stopped");
        });

        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
