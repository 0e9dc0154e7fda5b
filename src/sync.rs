//! Keeps the cache fresh: cursor deltas where the backend has a change feed,
//! first-page polling where it doesn't, and targeted refreshes on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::ThreadCache;
use crate::config::SyncSettings;
use crate::driver::MailDriver;
use crate::error::{MailError, MailResult};
use crate::model::{AccountId, Thread, ThreadId, ViewKey};

/// Out-of-band "these threads changed" hint from a push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub thread_ids: Vec<ThreadId>,
}

/// What one sync pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Applied this many cursor patches
    Deltas(usize),
    /// Re-listed this many open views
    Polled(usize),
    /// The cursor was stale; every open view was reloaded
    Resynced,
}

pub struct SyncScheduler {
    driver: Arc<MailDriver>,
    cache: Arc<ThreadCache>,
    settings: SyncSettings,
    full_resyncs: AtomicU64,
}

impl SyncScheduler {
    pub fn new(driver: Arc<MailDriver>, cache: Arc<ThreadCache>, settings: SyncSettings) -> Self {
        Self {
            driver,
            cache,
            settings,
            full_resyncs: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.settings.page_size
    }

    /// Number of full resyncs caused by stale cursors
    pub fn full_resyncs(&self) -> u64 {
        self.full_resyncs.load(Ordering::SeqCst)
    }

    /// Resets the cache when the active account changed since the last pass
    pub(crate) fn ensure_account(&self) -> MailResult<AccountId> {
        let active = self.driver.active_account()?;
        if self.cache.snapshot().account() != Some(active.as_str()) {
            info!("sync: switching cache to account {}", active);
            self.cache.reset(Some(active.clone()));
        }
        Ok(active)
    }

    /// Whether the cache holds `account`'s threads once it follows the active account
    pub(crate) fn serves(&self, account: &str) -> bool {
        matches!(self.ensure_account(), Ok(active) if active == account)
    }

    /// Loads the first page of a view, opening it
    pub async fn open_view(&self, view: &ViewKey) -> MailResult<()> {
        self.ensure_account()?;
        let ticket = self.cache.begin_fetch();
        let page = self
            .driver
            .list_threads(view.folder, view.query.as_deref(), None, self.settings.page_size)
            .await?;
        self.cache.store_page(view, &page, ticket, false);
        Ok(())
    }

    /// Re-fetches exactly these threads; vanished ones are evicted.
    /// Returns the ids that could not be read back.
    pub async fn refresh_threads(&self, ids: &[ThreadId]) -> Vec<ThreadId> {
        let calls = match self
            .ensure_account()
            .and_then(|account| self.driver.for_account(&account))
        {
            Ok(calls) => calls,
            Err(e) => {
                warn!("sync: cannot refresh {} thread(s): {}", ids.len(), e);
                return ids.to_vec();
            }
        };

        let ticket = self.cache.begin_fetch();
        let mut fresh = Vec::with_capacity(ids.len());
        let mut failed = Vec::new();
        for id in ids {
            match calls.get_thread(id).await {
                Ok(thread) => fresh.push(thread),
                Err(MailError::NotFound(_)) => self.cache.evict(id),
                Err(e) => {
                    warn!("sync: refresh of {} failed: {}", id, e);
                    failed.push(id.clone());
                }
            }
        }

        debug!("sync: refreshed {}/{} thread(s)", fresh.len(), ids.len());
        self.cache.store_threads(fresh, ticket);
        failed
    }

    /// Reads back threads a write just succeeded on, retrying transient
    /// failures. Threads that still can't be read keep `acknowledged` applied
    /// to their cached copy, so the accepted change outlives its ledger entry.
    pub(crate) async fn confirm_threads(&self, ids: &[ThreadId], acknowledged: impl Fn(&mut Thread)) {
        let retry = self.driver.retry_policy();
        let mut unread = self.refresh_threads(ids).await;
        let mut attempt = 0;
        while !unread.is_empty() && attempt < retry.max_retries {
            tokio::time::sleep(retry.backoff(attempt)).await;
            attempt += 1;
            unread = self.refresh_threads(&unread).await;
        }
        if unread.is_empty() {
            return;
        }

        warn!(
            "sync: keeping acknowledged change on {} unconfirmed thread(s)",
            unread.len()
        );
        let ticket = self.cache.begin_fetch();
        let cache = self.cache.snapshot();
        let patched: Vec<Thread> = unread
            .iter()
            .filter_map(|id| cache.thread(id))
            .map(|thread| {
                let mut thread = thread.clone();
                acknowledged(&mut thread);
                thread
            })
            .collect();
        self.cache.store_threads(patched, ticket);
    }

    pub async fn refresh_labels(&self) -> MailResult<()> {
        let labels = self.driver.list_labels().await?;
        self.cache.set_labels(labels);
        Ok(())
    }

    /// One sync pass
    pub async fn tick(&self) -> MailResult<SyncOutcome> {
        self.ensure_account()?;

        let cursor = self.cache.snapshot().cursor().map(str::to_string);
        match cursor {
            Some(cursor) => self.apply_deltas(&cursor).await,
            None => match self.driver.sync_cursor().await? {
                Some(fresh) => {
                    // Baseline: views are loaded fresh, then deltas flow from here
                    let polled = self.poll_views().await?;
                    self.cache.set_cursor(Some(fresh));
                    Ok(SyncOutcome::Polled(polled))
                }
                None => Ok(SyncOutcome::Polled(self.poll_views().await?)),
            },
        }
    }

    async fn apply_deltas(&self, cursor: &str) -> MailResult<SyncOutcome> {
        let ticket = self.cache.begin_fetch();
        match self.driver.changes_since(cursor).await {
            Ok(changes) => {
                let count = changes.patches.len();
                if count > 0 {
                    debug!("sync: applying {} patch(es) since {}", count, cursor);
                }
                self.cache.apply_changes(changes, ticket);
                Ok(SyncOutcome::Deltas(count))
            }
            Err(MailError::InvalidCursor) => {
                warn!("sync: cursor {} is stale, resyncing", cursor);
                self.full_resync().await?;
                Ok(SyncOutcome::Resynced)
            }
            Err(e) => Err(e),
        }
    }

    /// Reloads every open view's first page and takes a fresh cursor
    pub async fn full_resync(&self) -> MailResult<()> {
        self.full_resyncs.fetch_add(1, Ordering::SeqCst);

        // Taken first so nothing that lands during the reload is skipped
        let fresh = self.driver.sync_cursor().await?;
        let views = self.cache.snapshot().open_views();
        for view in &views {
            let ticket = self.cache.begin_fetch();
            let page = self
                .driver
                .list_threads(view.folder, view.query.as_deref(), None, self.settings.page_size)
                .await?;
            self.cache.store_page(view, &page, ticket, false);
        }
        self.cache.set_cursor(fresh);

        info!("sync: full resync of {} view(s) complete", views.len());
        Ok(())
    }

    async fn poll_views(&self) -> MailResult<usize> {
        let views = self.cache.snapshot().open_views();
        for view in &views {
            let ticket = self.cache.begin_fetch();
            match self
                .driver
                .list_threads(view.folder, view.query.as_deref(), None, self.settings.page_size)
                .await
            {
                Ok(page) => {
                    self.cache.merge_first_page(view, &page, ticket);
                }
                // Mailbox was recreated under us; reload the view from scratch
                Err(MailError::InvalidCursor) => {
                    self.cache.close_view(view);
                    self.open_view(view).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(views.len())
    }

    /// Runs passes on the poll interval until `shutdown` flips, reacting to pushes in between
    pub async fn run(
        self: Arc<Self>,
        mut push: Option<mpsc::Receiver<PushNotification>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.settings.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut push_open = push.is_some();

        info!(
            "sync: running every {:?} (push {})",
            self.settings.poll_interval(),
            if push_open { "on" } else { "off" }
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(outcome) => debug!("sync: pass done: {:?}", outcome),
                        Err(e) => warn!("sync: pass failed: {}", e),
                    }
                }
                note = next_push(&mut push), if push_open => match note {
                    Some(note) => {
                        self.refresh_threads(&note.thread_ids).await;
                    }
                    None => {
                        debug!("sync: push channel closed");
                        push_open = false;
                    }
                },
            }
        }

        info!("sync: stopped");
    }
}

async fn next_push(push: &mut Option<mpsc::Receiver<PushNotification>>) -> Option<PushNotification> {
    match push {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::events::EventBus;
    use crate::model::Folder;
    use crate::testing::FakeGmail;
    use std::time::Duration;

    fn scheduler(fake: &FakeGmail) -> (Arc<SyncScheduler>, Arc<ThreadCache>) {
        let driver = Arc::new(fake.driver(RetryPolicy::immediate(1)));
        let cache = Arc::new(ThreadCache::new(Arc::new(EventBus::default())));
        let settings = SyncSettings {
            poll_interval_secs: 30,
            page_size: 2,
        };
        (
            Arc::new(SyncScheduler::new(driver, Arc::clone(&cache), settings)),
            cache,
        )
    }

    #[tokio::test]
    async fn test_first_tick_takes_baseline_cursor() {
        let fake = FakeGmail::new();
        fake.add_thread("t1", &["INBOX"]);
        let (sync, cache) = scheduler(&fake);
        let inbox = ViewKey::folder(Folder::Inbox);
        sync.open_view(&inbox).await.unwrap();

        assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Polled(1));
        assert_eq!(cache.snapshot().cursor(), Some(fake.history_id().to_string().as_str()));
    }

    #[tokio::test]
    async fn test_cursor_deltas_patch_open_views() {
        let fake = FakeGmail::new();
        fake.add_thread("t1", &["INBOX"]);
        let (sync, cache) = scheduler(&fake);
        let inbox = ViewKey::folder(Folder::Inbox);
        sync.open_view(&inbox).await.unwrap();
        sync.tick().await.unwrap();

        fake.add_thread("t2", &["INBOX"]);
        fake.set_labels("t1", &[], &["INBOX"]);

        assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Deltas(2));
        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&inbox), vec!["t2"]);
        assert_eq!(snap.thread("t1").unwrap().folder, Folder::Archive);
    }

    #[tokio::test]
    async fn test_invalid_cursor_triggers_exactly_one_full_resync() {
        let fake = FakeGmail::new();
        for id in ["t1", "t2", "t3"] {
            fake.add_thread(id, &["INBOX"]);
        }
        let (sync, cache) = scheduler(&fake);
        let inbox = ViewKey::folder(Folder::Inbox);
        sync.open_view(&inbox).await.unwrap();
        sync.tick().await.unwrap();

        fake.add_thread("t4", &["INBOX"]);
        fake.delete_thread("t3");
        fake.expire_history();

        assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Resynced);
        assert_eq!(sync.full_resyncs(), 1);

        let direct = sync
            .driver
            .list_threads(Folder::Inbox, None, None, sync.page_size())
            .await
            .unwrap();
        let direct_ids: Vec<_> = direct.threads.iter().map(|t| t.id.clone()).collect();
        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&inbox), direct_ids);
        assert_eq!(snap.view(&inbox).unwrap().next_page_token, direct.next_page_token);
        assert_eq!(snap.cursor(), Some(fake.history_id().to_string().as_str()));

        // The fresh cursor works again
        assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Deltas(0));
        assert_eq!(sync.full_resyncs(), 1);
    }

    #[tokio::test]
    async fn test_targeted_refresh_evicts_vanished_threads() {
        let fake = FakeGmail::new();
        fake.add_thread("t1", &["INBOX"]);
        fake.add_thread("t2", &["INBOX"]);
        let (sync, cache) = scheduler(&fake);
        let inbox = ViewKey::folder(Folder::Inbox);
        sync.open_view(&inbox).await.unwrap();

        fake.delete_thread("t1");
        fake.set_labels("t2", &["STARRED"], &[]);
        sync.refresh_threads(&["t1".to_string(), "t2".to_string()]).await;

        let snap = cache.snapshot();
        assert!(!snap.contains("t1"));
        assert_eq!(snap.view_ids(&inbox), vec!["t2"]);
        assert!(snap.thread("t2").unwrap().starred);
    }

    #[tokio::test]
    async fn test_poll_drops_ids_that_vanished() {
        let fake = FakeGmail::new();
        fake.add_thread("t1", &["INBOX"]);
        fake.add_thread("t2", &["INBOX"]);
        let (sync, cache) = scheduler(&fake);
        let inbox = ViewKey::folder(Folder::Inbox);
        sync.open_view(&inbox).await.unwrap();

        fake.delete_thread("t1");
        let polled = sync.poll_views().await.unwrap();

        assert_eq!(polled, 1);
        assert_eq!(cache.snapshot().view_ids(&inbox), vec!["t2"]);
    }

    #[tokio::test]
    async fn test_run_handles_push_then_stops() {
        let fake = FakeGmail::new();
        fake.add_thread("t1", &["INBOX"]);
        let (sync, cache) = scheduler(&fake);
        sync.tick().await.unwrap();

        let (push_tx, push_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&sync).run(Some(push_rx), stop_rx));

        push_tx
            .send(PushNotification {
                thread_ids: vec!["t1".to_string()],
            })
            .await
            .unwrap();

        for _ in 0..100 {
            if cache.snapshot().contains("t1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.snapshot().contains("t1"));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
