//! Shutdown Coordinator (spec §4.8): priority-ordered teardown hooks with
//! per-hook and overall deadlines, generalized from `bin/fc-dev`'s
//! `shutdown_signal()` + single `broadcast::channel(())` pattern into a
//! registrable hook system instead of one hand-wired sequence of
//! component shutdowns.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

pub const PRIORITY_POSITION_SAVE: i32 = 5;
pub const PRIORITY_METRICS_FLUSH: i32 = 15;
pub const PRIORITY_DATABASE_CLEANUP: i32 = 25;
pub const PRIORITY_STREAM_STOP: i32 = 35;

const FORCED_TERMINATION_MARGIN: Duration = Duration::from_secs(5);

type HookFuture = Pin<Box<dyn Future<Output = rc_common::Result<()>> + Send>>;
type HookAction = Box<dyn Fn() -> HookFuture + Send + Sync>;

struct Hook {
    name: String,
    priority: i32,
    timeout: Duration,
    action: HookAction,
}

/// Ordered teardown on signal or panic, with per-hook and overall deadlines.
pub struct ShutdownCoordinator {
    hooks: Mutex<Vec<Hook>>,
    overall_deadline: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new(overall_deadline: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self { hooks: Mutex::new(Vec::new()), overall_deadline, shutdown_tx })
    }

    /// A receiver that fires once teardown begins, so long-lived loops
    /// (HTTP servers, background tickers) can stop independently of the
    /// ordered hooks below.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn register<F, Fut>(&self, name: impl Into<String>, priority: i32, timeout: Duration, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = rc_common::Result<()>> + Send + 'static,
    {
        let boxed_action: HookAction = Box::new(move || Box::pin(action()) as HookFuture);
        let hook = Hook { name: name.into(), priority, timeout, action: boxed_action };
        let mut hooks = self.hooks.lock().await;
        let insert_at = hooks.partition_point(|h| h.priority <= priority);
        hooks.insert(insert_at, hook);
    }

    /// Blocks until SIGINT/SIGTERM (or Ctrl+C on non-unix), mirroring
    /// `bin/fc-dev`'s `shutdown_signal()`.
    pub async fn wait_for_signal() {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }

    /// Broadcasts shutdown to subscribers, then runs registered hooks in
    /// priority order, each bounded by its own timeout, the whole sequence
    /// bounded by `overall_deadline`.
    pub async fn run(&self) {
        info!("shutdown coordinator: broadcasting shutdown signal");
        let _ = self.shutdown_tx.send(());

        let hooks_snapshot: Vec<(String, i32, Duration)> = {
            let hooks = self.hooks.lock().await;
            hooks.iter().map(|h| (h.name.clone(), h.priority, h.timeout)).collect()
        };

        let run_all = async {
            let hooks = self.hooks.lock().await;
            for hook in hooks.iter() {
                info!(hook = %hook.name, priority = hook.priority, "running shutdown hook");
                match tokio::time::timeout(hook.timeout, (hook.action)()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(hook = %hook.name, error = %e, "shutdown hook failed"),
                    Err(_) => warn!(hook = %hook.name, "shutdown hook timed out"),
                }
            }
        };

        if tokio::time::timeout(self.overall_deadline, run_all).await.is_err() {
            warn!(
                deadline_secs = self.overall_deadline.as_secs(),
                remaining_hooks = ?hooks_snapshot,
                "shutdown overall deadline elapsed, some hooks may not have run"
            );
        }

        info!("shutdown coordinator: teardown complete");
    }

    /// Installs a panic hook that initiates shutdown and schedules a
    /// forced process exit `deadline + 5s` after the panic, in case
    /// teardown itself hangs.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let coordinator = self.clone();
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            error!(panic = %info, "panic detected, initiating emergency shutdown");
            default_hook(info);

            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator.run().await;
            });

            let force_after = coordinator.overall_deadline + FORCED_TERMINATION_MARGIN;
            tokio::spawn(async move {
                tokio::time::sleep(force_after).await;
                error!("forced termination after panic safety margin elapsed");
                std::process::exit(2);
            });
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn hooks_run_in_priority_order() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        coordinator
            .register("stream_stop", PRIORITY_STREAM_STOP, Duration::from_secs(1), move || {
                let o1 = o1.clone();
                async move {
                    o1.lock().await.push("stream_stop");
                    Ok(())
                }
            })
            .await;

        let o2 = order.clone();
        coordinator
            .register("position_save", PRIORITY_POSITION_SAVE, Duration::from_secs(1), move || {
                let o2 = o2.clone();
                async move {
                    o2.lock().await.push("position_save");
                    Ok(())
                }
            })
            .await;

        coordinator.run().await;

        let recorded = order.lock().await;
        assert_eq!(*recorded, vec!["position_save", "stream_stop"]);
    }

    #[tokio::test]
    async fn slow_hook_is_timed_out_not_fatal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();

        coordinator
            .register("hangs", PRIORITY_METRICS_FLUSH, Duration::from_millis(10), move || {
                let ran_clone = ran_clone.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    ran_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        coordinator.run().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
