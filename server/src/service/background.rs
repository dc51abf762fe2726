//! Periodic background tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::registry::ClusterRegistry;
use super::session::SessionOrchestrator;

/// Run `tick` every `period` until `shutdown` flips to true
///
/// The first tick fires one full period after spawning.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        info!("{} started, every {:?}", name, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("{} tick", name);
                    tick().await;
                }
                // The watch guard must not outlive this arm
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        info!("{} stopped", name);
    })
}

/// Ends expired sessions on every tick
pub fn spawn_session_sweeper(
    orchestrator: Arc<SessionOrchestrator>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("Session sweeper", period, shutdown, move || {
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator.sweep_expired().await;
        }
    })
}

/// Re-probes every registered cluster on every tick
pub fn spawn_health_monitor(
    registry: Arc<ClusterRegistry>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("Cluster health monitor", period, shutdown, move || {
        let registry = registry.clone();
        async move {
            let connected = registry.health_check_all().await;
            debug!("{} cluster(s) connected", connected);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = ticks.clone();
        let handle = spawn_periodic("test", Duration::from_secs(60), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
