//! Background mutation queue.
//!
//! Each dispatched action runs as its own task: backend call with transient
//! retries, then a targeted refresh and settlement, or a rollback and a
//! failure event. Calls of the same kind on the same thread are chained in
//! dispatch order so the newest value is also the last one sent.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::driver::{AccountCalls, MailDriver};
use crate::error::{MailError, MailResult};
use crate::events::{EventBus, StateEvent};
use crate::ledger::{ActionKind, ActionPayload, OptimisticAction, OptimisticStore};
use crate::model::{AccountId, ThreadId, system_labels};
use crate::sync::SyncScheduler;

type Lane = (AccountId, ThreadId, ActionKind);

pub struct MutationQueue {
    driver: Arc<MailDriver>,
    ledger: Arc<OptimisticStore>,
    sync: Arc<SyncScheduler>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
    /// Completion signal of the newest action per lane
    lanes: Mutex<HashMap<Lane, oneshot::Receiver<()>>>,
    active: AtomicUsize,
    idle: Notify,
}

impl MutationQueue {
    pub fn new(
        driver: Arc<MailDriver>,
        ledger: Arc<OptimisticStore>,
        sync: Arc<SyncScheduler>,
        events: Arc<EventBus>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            ledger,
            sync,
            events,
            retry,
            lanes: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Number of actions not yet settled or rolled back
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until every submitted action has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Starts the backend work for a freshly recorded action
    pub fn submit(self: &Arc<Self>, action: OptimisticAction) -> JoinHandle<()> {
        let (waits, done) = self.join_lanes(&action);
        self.active.fetch_add(1, Ordering::SeqCst);

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            for wait in waits {
                // Err just means the predecessor finished
                let _ = wait.await;
            }
            queue.process(action).await;
            drop(done);

            if queue.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                queue.idle.notify_waiters();
            }
        })
    }

    fn join_lanes(&self, action: &OptimisticAction) -> (Vec<oneshot::Receiver<()>>, Vec<oneshot::Sender<()>>) {
        let mut lanes = self.lanes.lock();
        lanes.retain(|_, rx| matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

        let mut waits = Vec::new();
        let mut done = Vec::with_capacity(action.targets.len());
        for thread in &action.targets {
            let (tx, rx) = oneshot::channel();
            let lane = (action.account.clone(), thread.clone(), action.kind());
            if let Some(previous) = lanes.insert(lane, rx) {
                waits.push(previous);
            }
            done.push(tx);
        }
        (waits, done)
    }

    async fn process(&self, action: OptimisticAction) {
        let kind = action.kind();
        let targets = self.ledger.live_targets(&action.id);
        if targets.is_empty() {
            // A newer action of this kind owns every thread now
            debug!("queue: {} action {} superseded before sending", kind, action.id);
            self.ledger.settle(&action.id);
            return;
        }

        let result = self.execute(&action, &targets).await;
        // The cache only holds the active account's threads
        let cached = self.sync.serves(&action.account);
        match result {
            Ok(()) => {
                if cached {
                    self.sync
                        .confirm_threads(&targets, |thread| action.apply_to(thread))
                        .await;
                }
                self.ledger.settle(&action.id);
                info!(
                    "queue: {} action {} settled for {} thread(s)",
                    kind,
                    action.id,
                    targets.len()
                );
            }
            Err(error) => {
                if cached && matches!(error, MailError::NotFound(_)) {
                    // Evicts whichever targets are gone
                    self.sync.refresh_threads(&targets).await;
                }
                let threads = self.ledger.rollback(&action.id);
                warn!(
                    "queue: {} action {} rolled back: {}",
                    kind, action.id, error
                );
                self.events.publish(StateEvent::MutationFailed {
                    action: action.id,
                    kind,
                    threads,
                    error,
                });
            }
        }
    }

    async fn execute(&self, action: &OptimisticAction, targets: &[ThreadId]) -> MailResult<()> {
        // Bound to the account the action was dispatched on, not whichever is active now
        let calls = self.driver.for_account(&action.account)?;
        let mut attempt = 0;
        loop {
            match perform(&calls, &action.payload, targets).await {
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "queue: {} (retry {}/{} in {:?})",
                        e,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

}

async fn perform(calls: &AccountCalls<'_>, payload: &ActionPayload, targets: &[ThreadId]) -> MailResult<()> {
    match payload {
        ActionPayload::Move(destination) => calls.move_threads(targets, *destination).await,
        ActionPayload::Star(on) => toggle(calls, targets, system_labels::STARRED, *on).await,
        ActionPayload::Important(on) => toggle(calls, targets, system_labels::IMPORTANT, *on).await,
        ActionPayload::Read(read) => calls.set_read_state(targets, *read).await,
        ActionPayload::Label { add, remove } => calls.modify_labels(targets, add, remove).await,
    }
}

async fn toggle(calls: &AccountCalls<'_>, targets: &[ThreadId], label: &str, on: bool) -> MailResult<()> {
    let label = [label.to_string()];
    if on {
        calls.modify_labels(targets, &label, &[]).await
    } else {
        calls.modify_labels(targets, &[], &label).await
    }
}
