//! Periodic reconciliation scheduler.
//!
//! One tokio task per Application ticks at its refresh interval and runs a
//! refresh cycle; `trigger` requests one immediately. A semaphore bounds how
//! many cycles run at once across Applications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::ReconcileError;
use super::policy::SyncTrigger;
use super::reconciler::Reconciler;
use super::watcher::SourceChangeEvent;

type Triggers = Arc<Mutex<HashMap<String, mpsc::Sender<()>>>>;

/// Drives refresh cycles for every registered Application.
pub struct SyncScheduler {
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    triggers: Triggers,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let max_concurrent = reconciler.settings().max_concurrent_reconciles.max(1);
        let (stop_tx, _) = watch::channel(false);
        Self {
            reconciler,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            shutdown: Arc::new(AtomicBool::new(false)),
            stop_tx,
            triggers: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns a loop for every registered Application without one.
    ///
    /// Safe to call again after registering more Applications. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) {
        if self.is_stopped() {
            log::warn!("Scheduler already stopped, not starting loops");
            return;
        }
        for name in self.reconciler.applications() {
            let interval = match self.reconciler.refresh_interval(&name) {
                Ok(interval) => interval,
                Err(_) => continue,
            };
            let trigger_rx = {
                let mut triggers = self.lock_triggers();
                if triggers.contains_key(&name) {
                    continue;
                }
                let (tx, rx) = mpsc::channel(1);
                triggers.insert(name.clone(), tx);
                rx
            };

            log::info!("Scheduling '{}' every {:?}", name, interval);
            let handle = tokio::spawn(app_loop(
                name,
                interval,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.permits),
                Arc::clone(&self.shutdown),
                self.stop_tx.subscribe(),
                trigger_rx,
                Arc::clone(&self.triggers),
            ));
            self.lock_handles().push(handle);
        }
    }

    /// Refreshes Applications on source change notifications.
    pub fn watch_sources(&self, mut changes: broadcast::Receiver<SourceChangeEvent>) {
        let reconciler = Arc::clone(&self.reconciler);
        let triggers = Arc::clone(&self.triggers);
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = changes.recv() => event,
                    _ = stop_rx.changed() => break,
                };
                match event {
                    Ok(event) => {
                        let cancelled = reconciler.notify_revision(&event.repo_url, None).await;
                        if !cancelled.is_empty() {
                            log::info!("Superseded in-flight sync(s): {}", cancelled.join(", "));
                        }
                        for name in reconciler.applications_for_repo(&event.repo_url) {
                            send_trigger(&triggers, &name);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {} source change event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.lock_handles().push(handle);
    }

    /// Requests an immediate refresh of `name`. Returns false if it has no
    /// running loop. Requests made while one is pending are coalesced.
    pub fn trigger(&self, name: &str) -> bool {
        send_trigger(&self.triggers, name)
    }

    /// Signals every loop to stop after its current cycle.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Waits for every loop to finish. Call after [`stop`](Self::stop).
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                log::warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }

    fn lock_triggers(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<()>>> {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn send_trigger(triggers: &Mutex<HashMap<String, mpsc::Sender<()>>>, name: &str) -> bool {
    let triggers = triggers.lock().unwrap_or_else(|e| e.into_inner());
    match triggers.get(name) {
        Some(tx) => match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        },
        None => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn app_loop(
    name: String,
    interval: std::time::Duration,
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
    mut trigger_rx: mpsc::Receiver<()>,
    triggers: Triggers,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {},
            Some(()) = trigger_rx.recv() => {
                log::debug!("Refresh of '{}' triggered", name);
            },
            _ = stop_rx.changed() => break,
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let Ok(_permit) = permits.acquire().await else {
            break;
        };
        match reconciler.reconcile(&name, SyncTrigger::Refresh).await {
            Ok(outcome) => log::debug!(
                "Cycle of '{}' at {}: {:?}, {} / {}",
                name,
                outcome.revision.short(),
                outcome.decision,
                outcome.phase,
                outcome.health
            ),
            Err(ReconcileError::ApplicationNotFound(_)) => {
                log::info!("Application '{}' removed, stopping its loop", name);
                break;
            }
            Err(e) => log::warn!("Cycle of '{}' failed: {}", name, e),
        }
    }

    triggers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&name);
}
