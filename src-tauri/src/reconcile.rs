//! Background ledger reconciliation.
//!
//! Runs [`RecordStore::reconcile`] on a fixed interval, and early whenever the
//! records key changes in the underlying store (another window, another process,
//! or a hand-edited file).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::kv::{StorageEvent, SubscriptionId};
use crate::snapshot::RECORDS_KEY;
use crate::store::RecordStore;

fn nudge(wake: &SyncSender<()>) {
    match wake.try_send(()) {
        Ok(()) | Err(TrySendError::Full(()) | TrySendError::Disconnected(())) => {}
    }
}

pub struct ReconcileWorker {
    store: Arc<RecordStore>,
    wake: SyncSender<()>,
    stop: Arc<AtomicBool>,
    subscription: SubscriptionId,
    thread: Option<JoinHandle<()>>,
}

impl ReconcileWorker {
    pub fn spawn(store: Arc<RecordStore>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let (wake, wake_rx) = mpsc::sync_channel::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let listener_wake = wake.clone();
        let subscription = store.kv().subscribe(Arc::new(move |event: &StorageEvent| {
            if event.key == RECORDS_KEY {
                nudge(&listener_wake);
            }
        }));

        let worker_store = Arc::clone(&store);
        let worker_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("bursary-reconcile".to_string())
            .spawn(move || loop {
                match wake_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                match worker_store.reconcile() {
                    Ok(status) => debug!(allocated = status.allocated, "periodic reconcile"),
                    Err(err) => warn!(%err, "periodic reconcile failed"),
                }
            })
            .map_err(|err| warn!(%err, "failed to start reconcile worker"))
            .ok();

        ReconcileWorker {
            store,
            wake,
            stop,
            subscription,
            thread,
        }
    }

    /// Same as dropping the worker.
    pub fn stop(self) {
        drop(self);
    }

    fn shutdown(&mut self) {
        self.store.kv().unsubscribe(self.subscription);
        self.stop.store(true, Ordering::SeqCst);
        nudge(&self.wake);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("reconcile worker panicked");
            }
        }
    }
}

impl Drop for ReconcileWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
