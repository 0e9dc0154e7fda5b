//! The surface list and detail views talk to.
//!
//! Reads are synchronous snapshot folds of cache and ledger; everything that
//! talks to a backend is async. Mutations go through [`MailClient::dispatch`],
//! which returns as soon as the action is recorded.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::ThreadCache;
use crate::config::SyncSettings;
use crate::driver::MailDriver;
use crate::error::{MailError, MailResult};
use crate::events::{EventBus, StateEvent};
use crate::ledger::{ActionId, LedgerSnapshot, Mutation, OptimisticStore};
use crate::model::{Draft, Folder, Label, LabelSpec, MessageId, Thread, ThreadPage, ViewKey};
use crate::queue::MutationQueue;
use crate::sync::{PushNotification, SyncOutcome, SyncScheduler};

pub struct MailClient {
    driver: Arc<MailDriver>,
    cache: Arc<ThreadCache>,
    ledger: Arc<OptimisticStore>,
    queue: Arc<MutationQueue>,
    sync: Arc<SyncScheduler>,
    events: Arc<EventBus>,
}

impl MailClient {
    pub fn new(driver: Arc<MailDriver>, settings: SyncSettings) -> Self {
        let events = Arc::new(EventBus::default());
        let cache = Arc::new(ThreadCache::new(Arc::clone(&events)));
        let ledger = Arc::new(OptimisticStore::new(Arc::clone(&events)));
        let sync = Arc::new(SyncScheduler::new(
            Arc::clone(&driver),
            Arc::clone(&cache),
            settings,
        ));
        let queue = Arc::new(MutationQueue::new(
            Arc::clone(&driver),
            Arc::clone(&ledger),
            Arc::clone(&sync),
            Arc::clone(&events),
            driver.retry_policy().clone(),
        ));

        Self {
            driver,
            cache,
            ledger,
            queue,
            sync,
            events,
        }
    }

    pub fn driver(&self) -> &MailDriver {
        &self.driver
    }

    pub fn scheduler(&self) -> Arc<SyncScheduler> {
        Arc::clone(&self.sync)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Lists a page from the backend, caches it and returns it with pending
    /// actions applied. Threads with a pending move are left out. A page
    /// token the backend no longer honours restarts the view from its first
    /// page.
    pub async fn list_threads(
        &self,
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> MailResult<ThreadPage> {
        self.sync.ensure_account()?;
        let view = ViewKey {
            folder,
            query: query
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string),
        };

        let mut ticket = self.cache.begin_fetch();
        let mut append = page_token.is_some();
        let page = match self
            .driver
            .list_threads(folder, view.query.as_deref(), page_token, page_size)
            .await
        {
            Ok(page) => page,
            Err(MailError::InvalidCursor) if append => {
                warn!("client: page token for {} is stale, reloading from the top", folder);
                self.cache.close_view(&view);
                append = false;
                ticket = self.cache.begin_fetch();
                self.driver
                    .list_threads(folder, view.query.as_deref(), None, page_size)
                    .await?
            }
            Err(e) => return Err(e),
        };
        self.cache.store_page(&view, &page, ticket, append);

        let cache = self.cache.snapshot();
        let ledger = self.ledger.snapshot();
        let pending = ledger.for_account(cache.account());
        let shown = cache.view_ids(&view);
        let threads = page
            .threads
            .iter()
            .filter(|t| shown.contains(&t.id))
            .filter_map(|t| pending.visible(cache.thread(&t.id).unwrap_or(t)))
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: page.next_page_token,
        })
    }

    /// Loads a thread with its messages, pending actions applied
    pub async fn get_thread(&self, id: &str) -> MailResult<Thread> {
        self.sync.ensure_account()?;
        let ticket = self.cache.begin_fetch();
        let thread = match self.driver.get_thread(id).await {
            Ok(thread) => thread,
            Err(MailError::NotFound(message)) => {
                self.cache.evict(id);
                return Err(MailError::NotFound(message));
            }
            Err(e) => return Err(e),
        };

        self.cache.store_threads(vec![thread.clone()], ticket);
        let cache = self.cache.snapshot();
        let base = cache.thread(id).cloned().unwrap_or(thread);
        Ok(self.ledger.snapshot().for_account(cache.account()).effective(&base))
    }

    /// Records a mutation against the active account and hands it to the
    /// queue; must run inside a tokio runtime
    pub fn dispatch(&self, mutation: Mutation) -> MailResult<ActionId> {
        let account = self.sync.ensure_account()?;
        let action = self.ledger.begin(account, mutation)?;
        let id = action.id;
        self.queue.submit(action);
        Ok(id)
    }

    /// Cached threads of an open view as the user should see them
    pub fn threads(&self, view: &ViewKey) -> Vec<Thread> {
        let ledger = self.ledger.snapshot();
        let cache = self.cache.snapshot();
        let pending = ledger.for_account(cache.account());
        cache.view_threads(view).filter_map(|t| pending.visible(t)).collect()
    }

    /// Cached thread as the user should see it, including while a move is pending
    pub fn thread(&self, id: &str) -> Option<Thread> {
        let ledger = self.ledger.snapshot();
        let cache = self.cache.snapshot();
        let pending = ledger.for_account(cache.account());
        cache.thread(id).map(|t| pending.effective(t))
    }

    pub fn labels(&self) -> Vec<Label> {
        self.cache.snapshot().labels().to_vec()
    }

    pub fn ledger(&self) -> Arc<LedgerSnapshot> {
        self.ledger.snapshot()
    }

    /// Waits for every dispatched action to settle or roll back
    pub async fn settled(&self) {
        self.queue.wait_idle().await
    }

    pub async fn send_message(&self, draft: &Draft) -> MailResult<MessageId> {
        let id = self.driver.send_message(draft).await?;
        if let Some(thread_id) = &draft.thread_id {
            self.sync.refresh_threads(std::slice::from_ref(thread_id)).await;
        }
        Ok(id)
    }

    pub async fn refresh_labels(&self) -> MailResult<()> {
        self.sync.refresh_labels().await
    }

    pub async fn get_user_labels(&self) -> MailResult<Vec<Label>> {
        self.driver.get_user_labels().await
    }

    async fn labels_changed(&self) {
        if let Err(e) = self.sync.refresh_labels().await {
            warn!("client: label refresh failed: {}", e);
        }
    }

    pub async fn create_label(&self, spec: &LabelSpec) -> MailResult<Label> {
        let label = self.driver.create_label(spec).await?;
        self.labels_changed().await;
        Ok(label)
    }

    pub async fn update_label(&self, id: &str, spec: &LabelSpec) -> MailResult<Label> {
        let label = self.driver.update_label(id, spec).await?;
        self.labels_changed().await;
        Ok(label)
    }

    pub async fn delete_label(&self, id: &str) -> MailResult<()> {
        self.driver.delete_label(id).await?;
        self.labels_changed().await;
        Ok(())
    }

    /// Runs one sync pass now
    pub async fn sync(&self) -> MailResult<SyncOutcome> {
        self.sync.tick().await
    }

    /// Starts the background sync loop
    pub fn spawn_sync(
        &self,
        push: Option<mpsc::Receiver<PushNotification>>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.sync).run(push, shutdown))
    }
}
