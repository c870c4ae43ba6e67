//! Delayed command scheduler: releases commands queued with a fire-at
//! time into the outbound stream in time order.
//!
//! A single background `tokio::task` owns this concern — one dedicated
//! worker rather than a shared thread pool. The store is the sole source
//! of truth for ordering (`due_pending` returns entries sorted by
//! `(fire_at, insertion order)`); the worker sleeps until the earliest
//! pending `fire_at` rather than polling on a fixed interval, waking early
//! whenever a [`tokio::sync::Notify`] signals that a new entry might have
//! moved that deadline earlier.

use std::sync::Arc;

use dispatcher_common::clock::Clock;
use dispatcher_store::Store;
use tokio::sync::Notify;
use tracing::{debug, error};

/// Handle the reconciler uses to enqueue newly-gated commands and to wake
/// the background worker.
pub struct SchedulerHandle {
    notify: Arc<Notify>,
}

impl SchedulerHandle {
    /// Record that a new command was enqueued into the store's pending
    /// area, and wake the worker so it re-evaluates its wait against the
    /// new deadline.
    pub fn notify_enqueued(&self) {
        self.notify.notify_one();
    }

    /// A handle with no worker listening on the other end — useful in
    /// tests that only exercise the gate's enqueue path.
    pub fn detached() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Spawn the delayed scheduler's background worker.
///
/// On startup it replays the store's pending area for crash recovery:
/// any entry already at or past its `fire_at` is published immediately.
pub async fn spawn<S, C>(store: Arc<S>, clock: C, shutdown: Arc<Notify>) -> (SchedulerHandle, tokio::task::JoinHandle<()>)
where
    S: Store + 'static,
    C: Clock + Send + Sync + 'static,
{
    let notify = Arc::new(Notify::new());
    let handle = SchedulerHandle {
        notify: notify.clone(),
    };

    let worker_notify = notify.clone();
    let join = tokio::spawn(async move {
        run_worker(store, clock, worker_notify, shutdown).await;
    });

    (handle, join)
}

async fn run_worker<S, C>(store: Arc<S>, clock: C, notify: Arc<Notify>, shutdown: Arc<Notify>)
where
    S: Store,
    C: Clock,
{
    loop {
        let now = clock.now();
        match store.due_pending(now).await {
            Ok(due) => {
                for pending in due {
                    if let Err(e) = store.publish_outgoing(pending.id).await {
                        error!(id = pending.id.0, error = %e, "failed to publish outgoing command, will retry next wakeup");
                        continue;
                    }
                    debug!(id = pending.id.0, "released pending command to outgoing stream");
                }
            }
            Err(e) => {
                error!(error = %e, "delayed scheduler failed to read pending area, retrying");
            }
        }

        // Block until the next real deadline instead of polling: ask the
        // store for the earliest fire_at still pending and sleep exactly
        // that long, waking early if a new entry is enqueued or on shutdown.
        let sleep_for = match store.earliest_pending_fire_at().await {
            Ok(Some(fire_at)) => Some((fire_at - clock.now()).to_std().unwrap_or(std::time::Duration::ZERO)),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "delayed scheduler failed to read next deadline, retrying shortly");
                Some(std::time::Duration::from_millis(200))
            }
        };

        match sleep_for {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = notify.notified() => {}
                    _ = shutdown.notified() => {
                        debug!("delayed scheduler observed shutdown signal, exiting");
                        return;
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown.notified() => {
                        debug!("delayed scheduler observed shutdown signal, exiting");
                        return;
                    }
                }
            }
        }
    }
}
