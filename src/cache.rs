//! Thread and label cache for the active account.
//!
//! Holds the loaded pages of every open view, every known thread by id, the
//! label set and the sync cursor. Values here are authoritative backend state;
//! optimistic effects live in the ledger and are folded in by readers.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::events::{EventBus, StateEvent};
use crate::model::{AccountId, ChangeSet, Folder, Label, Thread, ThreadId, ThreadPage, ThreadPatch, ViewKey};

/// Orders fetches: a fetch only overwrites a thread if it began after the
/// newest targeted refresh of that thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    /// Loaded thread ids, newest first
    pub ids: Vec<ThreadId>,
    pub next_page_token: Option<String>,
    first_page_len: usize,
}

/// Whether a view's membership follows from the thread alone.
/// `None` for search views and folders the backend derives otherwise.
fn admits(view: &ViewKey, thread: &Thread) -> Option<bool> {
    match (view.folder, &view.query) {
        (Folder::Inbox | Folder::Archive | Folder::Spam | Folder::Bin, None) => {
            Some(thread.folder == view.folder)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    account: Option<AccountId>,
    threads: HashMap<ThreadId, Thread>,
    views: BTreeMap<ViewKey, ViewState>,
    labels: Vec<Label>,
    cursor: Option<String>,
    refreshed: HashMap<ThreadId, u64>,
}

impl CacheSnapshot {
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn thread(&self, id: &str) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.threads.contains_key(id)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn view(&self, view: &ViewKey) -> Option<&ViewState> {
        self.views.get(view)
    }

    pub fn view_ids(&self, view: &ViewKey) -> Vec<ThreadId> {
        self.views
            .get(view)
            .map(|v| v.ids.clone())
            .unwrap_or_default()
    }

    /// Cached threads of a view in list order
    pub fn view_threads<'a>(&'a self, view: &ViewKey) -> impl Iterator<Item = &'a Thread> {
        self.views
            .get(view)
            .into_iter()
            .flat_map(|v| v.ids.iter())
            .filter_map(|id| self.threads.get(id))
    }

    pub fn open_views(&self) -> Vec<ViewKey> {
        self.views.keys().cloned().collect()
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Stores `thread` unless a newer targeted refresh already did
    fn store_thread(&mut self, mut thread: Thread, ticket: FetchTicket, targeted: bool) -> bool {
        let newest = self.refreshed.get(&thread.id).copied().unwrap_or(0);
        if ticket.0 < newest {
            debug!("cache: ignoring stale fetch of {}", thread.id);
            return false;
        }
        if targeted {
            self.refreshed.insert(thread.id.clone(), ticket.0);
        }

        // A summary doesn't discard loaded messages that are still current
        if thread.messages.is_none()
            && let Some(old) = self.threads.get(&thread.id)
            && old.message_ids == thread.message_ids
            && old.unread == thread.unread
        {
            thread.messages = old.messages.clone();
        }

        self.threads.insert(thread.id.clone(), thread);
        true
    }

    /// Moves a thread into or out of the views whose membership it decides
    fn place(&mut self, id: &str, skip: Option<&ViewKey>) -> Vec<ViewKey> {
        let Some(thread) = self.threads.get(id) else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for (key, view) in self.views.iter_mut() {
            if skip == Some(key) {
                continue;
            }
            let present = view.ids.iter().position(|v| v == id);
            match (admits(key, thread), present) {
                (Some(true), _) => {
                    if let Some(at) = present {
                        view.ids.remove(at);
                    }
                    let at = view
                        .ids
                        .iter()
                        .position(|other| {
                            self.threads
                                .get(other)
                                .is_some_and(|t| t.last_activity < thread.last_activity)
                        })
                        .unwrap_or(view.ids.len());
                    // Older than everything loaded: it belongs to a page not fetched yet
                    if at == view.ids.len() && view.next_page_token.is_some() {
                        if present.is_some() {
                            changed.push(key.clone());
                        }
                        continue;
                    }
                    view.ids.insert(at, id.to_string());
                    if present != Some(at) {
                        changed.push(key.clone());
                    }
                }
                (Some(false), Some(at)) => {
                    view.ids.remove(at);
                    if at < view.first_page_len {
                        view.first_page_len -= 1;
                    }
                    changed.push(key.clone());
                }
                (None, Some(_)) => changed.push(key.clone()),
                _ => {}
            }
        }
        changed
    }

    fn evict(&mut self, id: &str) -> Vec<ViewKey> {
        self.threads.remove(id);
        self.refreshed.remove(id);

        let mut changed = Vec::new();
        for (key, view) in self.views.iter_mut() {
            if let Some(at) = view.ids.iter().position(|v| v == id) {
                view.ids.remove(at);
                if at < view.first_page_len {
                    view.first_page_len -= 1;
                }
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Page ids to show in `view`, storing each thread on the way
    fn store_listing(&mut self, view: &ViewKey, page: &ThreadPage, ticket: FetchTicket) -> (Vec<ThreadId>, Vec<ViewKey>) {
        let mut ids = Vec::with_capacity(page.threads.len());
        let mut changed = Vec::new();

        for thread in &page.threads {
            let id = thread.id.clone();
            if !self.store_thread(thread.clone(), ticket, false)
                && let Some(current) = self.threads.get(&id)
                && admits(view, current) == Some(false)
            {
                continue;
            }
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
            changed.extend(self.place(&id, Some(view)));
        }
        (ids, changed)
    }
}

pub struct ThreadCache {
    state: RwLock<Arc<CacheSnapshot>>,
    tickets: AtomicU64,
    events: Arc<EventBus>,
}

impl ThreadCache {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(Arc::new(CacheSnapshot::default())),
            tickets: AtomicU64::new(0),
            events,
        }
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.state.read())
    }

    /// Takes a ticket; call before issuing the backend request
    pub fn begin_fetch(&self) -> FetchTicket {
        FetchTicket(self.tickets.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn update<R>(&self, f: impl FnOnce(&mut CacheSnapshot) -> R) -> R {
        let mut guard = self.state.write();
        f(Arc::make_mut(&mut guard))
    }

    fn notify(&self, threads: &[ThreadId], views: Vec<ViewKey>) {
        self.events.threads_changed(threads);
        let mut seen = Vec::new();
        for view in views {
            if !seen.contains(&view) {
                seen.push(view.clone());
                self.events.publish(StateEvent::ViewChanged(view));
            }
        }
    }

    /// Drops everything and starts over for `account`
    pub fn reset(&self, account: Option<AccountId>) {
        debug!("cache: reset for account {:?}", account);
        self.update(|state| {
            *state = CacheSnapshot {
                account,
                ..CacheSnapshot::default()
            }
        });
        self.events.publish(StateEvent::LabelsChanged);
    }

    /// Stores a listed page; the first page replaces the view's contents
    pub fn store_page(&self, view: &ViewKey, page: &ThreadPage, ticket: FetchTicket, append: bool) {
        let ids: Vec<ThreadId> = page.threads.iter().map(|t| t.id.clone()).collect();
        let mut changed = self.update(|state| {
            let (shown, mut changed) = state.store_listing(view, page, ticket);
            let entry = state.views.entry(view.clone()).or_default();
            if append {
                for id in shown {
                    if !entry.ids.contains(&id) {
                        entry.ids.push(id);
                    }
                }
            } else {
                entry.first_page_len = shown.len();
                entry.ids = shown;
            }
            entry.next_page_token = page.next_page_token.clone();
            changed.push(view.clone());
            changed
        });
        changed.dedup();
        self.notify(&ids, changed);
    }

    /// Re-listed first page: ids that vanished from it are dropped, later pages kept.
    /// Returns the dropped ids.
    pub fn merge_first_page(&self, view: &ViewKey, page: &ThreadPage, ticket: FetchTicket) -> Vec<ThreadId> {
        let ids: Vec<ThreadId> = page.threads.iter().map(|t| t.id.clone()).collect();
        let (dropped, changed) = self.update(|state| {
            let (shown, mut changed) = state.store_listing(view, page, ticket);
            let old = state.views.get(view).cloned().unwrap_or_default();
            let split = old.first_page_len.min(old.ids.len());

            let dropped: Vec<ThreadId> = old.ids[..split]
                .iter()
                .filter(|id| !shown.contains(id))
                .cloned()
                .collect();
            let rest: Vec<ThreadId> = old.ids[split..]
                .iter()
                .filter(|id| !shown.contains(id))
                .cloned()
                .collect();

            let next_page_token = if rest.is_empty() {
                page.next_page_token.clone()
            } else {
                old.next_page_token.clone()
            };
            let mut merged = shown;
            let first_page_len = merged.len();
            merged.extend(rest);

            let updated = ViewState {
                ids: merged,
                next_page_token,
                first_page_len,
            };
            if updated != old {
                changed.push(view.clone());
            }
            state.views.insert(view.clone(), updated);
            (dropped, changed)
        });

        if !dropped.is_empty() {
            debug!("cache: {} thread(s) left {:?}", dropped.len(), view);
        }
        self.notify(&ids, changed);
        dropped
    }

    /// Stores threads fetched one by one and places them in the open views
    pub fn store_threads(&self, threads: Vec<Thread>, ticket: FetchTicket) {
        let ids: Vec<ThreadId> = threads.iter().map(|t| t.id.clone()).collect();
        let changed = self.update(|state| {
            let mut changed = Vec::new();
            for thread in threads {
                let id = thread.id.clone();
                if state.store_thread(thread, ticket, true) {
                    changed.extend(state.place(&id, None));
                }
            }
            changed
        });
        self.notify(&ids, changed);
    }

    /// Applies a cursor delta in order and advances the cursor
    pub fn apply_changes(&self, changes: ChangeSet, ticket: FetchTicket) {
        let ids: Vec<ThreadId> = changes
            .patches
            .iter()
            .map(|p| p.thread_id().to_string())
            .collect();
        let changed = self.update(|state| {
            let mut changed = Vec::new();
            for patch in changes.patches {
                match patch {
                    ThreadPatch::Upsert(thread) => {
                        let id = thread.id.clone();
                        if state.store_thread(thread, ticket, false) {
                            changed.extend(state.place(&id, None));
                        }
                    }
                    ThreadPatch::Remove(id) => changed.extend(state.evict(&id)),
                }
            }
            state.cursor = Some(changes.cursor);
            changed
        });
        self.notify(&ids, changed);
    }

    /// Forgets a thread that no longer exists upstream
    pub fn evict(&self, id: &str) {
        let changed = self.update(|state| state.evict(id));
        debug!("cache: evicted {}", id);
        self.notify(&[id.to_string()], changed);
    }

    pub fn close_view(&self, view: &ViewKey) {
        self.update(|state| state.views.remove(view));
    }

    pub fn set_labels(&self, labels: Vec<Label>) {
        self.update(|state| state.labels = labels);
        self.events.publish(StateEvent::LabelsChanged);
    }

    pub fn set_cursor(&self, cursor: Option<String>) {
        self.update(|state| state.cursor = cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn thread(id: &str, folder: Folder, age_minutes: i64) -> Thread {
        let mut thread = Thread::new(id, folder);
        thread.last_activity = Utc.timestamp_opt(1_700_000_000, 0).unwrap() - Duration::minutes(age_minutes);
        thread
    }

    fn page(threads: Vec<Thread>, next: Option<&str>) -> ThreadPage {
        ThreadPage {
            threads,
            next_page_token: next.map(str::to_string),
        }
    }

    fn cache() -> ThreadCache {
        ThreadCache::new(Arc::new(EventBus::default()))
    }

    #[test]
    fn test_first_page_replaces_and_next_page_appends() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);

        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("a", Folder::Inbox, 1)], Some("p2")), t, false);
        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("b", Folder::Inbox, 2), thread("a", Folder::Inbox, 1)], None), t, true);

        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&inbox), vec!["a", "b"]);
        assert_eq!(snap.view(&inbox).unwrap().next_page_token, None);

        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("c", Folder::Inbox, 0)], None), t, false);
        assert_eq!(cache.snapshot().view_ids(&inbox), vec!["c"]);
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let cache = cache();
        let before = cache.snapshot();
        cache.store_threads(vec![thread("a", Folder::Inbox, 0)], cache.begin_fetch());

        assert!(!before.contains("a"));
        assert!(cache.snapshot().contains("a"));
    }

    #[test]
    fn test_stale_listing_does_not_overwrite_targeted_refresh() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);

        let listing = cache.begin_fetch();
        let refresh = cache.begin_fetch();

        let mut fresh = thread("a", Folder::Archive, 0);
        fresh.starred = true;
        cache.store_threads(vec![fresh], refresh);
        cache.store_page(&inbox, &page(vec![thread("a", Folder::Inbox, 0)], None), listing, false);

        let snap = cache.snapshot();
        assert!(snap.thread("a").unwrap().starred);
        assert!(snap.view_ids(&inbox).is_empty());
    }

    #[test]
    fn test_refresh_moves_thread_between_folder_views() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);
        let archive = ViewKey::folder(Folder::Archive);

        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("x", Folder::Inbox, 5), thread("y", Folder::Inbox, 9)], None), t, false);
        let t = cache.begin_fetch();
        cache.store_page(&archive, &page(vec![thread("z", Folder::Archive, 7)], None), t, false);

        cache.store_threads(vec![thread("x", Folder::Archive, 5)], cache.begin_fetch());

        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&inbox), vec!["y"]);
        assert_eq!(snap.view_ids(&archive), vec!["x", "z"]);
    }

    #[test]
    fn test_search_views_only_update_existing_entries() {
        let cache = cache();
        let search = ViewKey::search(Folder::Inbox, "invoice");

        let t = cache.begin_fetch();
        cache.store_page(&search, &page(vec![thread("a", Folder::Inbox, 1)], None), t, false);
        cache.store_threads(vec![thread("b", Folder::Inbox, 0)], cache.begin_fetch());

        let mut starred = thread("a", Folder::Inbox, 1);
        starred.starred = true;
        cache.store_threads(vec![starred], cache.begin_fetch());

        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&search), vec!["a"]);
        assert!(snap.view_threads(&search).next().unwrap().starred);
    }

    #[test]
    fn test_old_thread_not_placed_past_unloaded_pages() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);

        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("new", Folder::Inbox, 0)], Some("p2")), t, false);
        cache.store_threads(vec![thread("ancient", Folder::Inbox, 10_000)], cache.begin_fetch());

        assert_eq!(cache.snapshot().view_ids(&inbox), vec!["new"]);
    }

    #[test]
    fn test_merge_first_page_drops_vanished_ids() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);

        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("a", Folder::Inbox, 1), thread("b", Folder::Inbox, 2)], Some("p2")), t, false);
        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("c", Folder::Inbox, 3)], None), t, true);

        let t = cache.begin_fetch();
        let dropped = cache.merge_first_page(&inbox, &page(vec![thread("n", Folder::Inbox, 0), thread("a", Folder::Inbox, 1)], Some("p2")), t);

        assert_eq!(dropped, vec!["b"]);
        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&inbox), vec!["n", "a", "c"]);
        assert_eq!(snap.view(&inbox).unwrap().next_page_token, None);
    }

    #[test]
    fn test_apply_changes_in_order_and_advance_cursor() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);
        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("a", Folder::Inbox, 1)], None), t, false);

        let changes = ChangeSet {
            patches: vec![
                ThreadPatch::Upsert(thread("b", Folder::Inbox, 0)),
                ThreadPatch::Remove("a".to_string()),
                ThreadPatch::Upsert(thread("a", Folder::Inbox, 3)),
                ThreadPatch::Remove("a".to_string()),
            ],
            cursor: "42".to_string(),
        };
        cache.apply_changes(changes, cache.begin_fetch());

        let snap = cache.snapshot();
        assert_eq!(snap.view_ids(&inbox), vec!["b"]);
        assert!(!snap.contains("a"));
        assert_eq!(snap.cursor(), Some("42"));
    }

    #[test]
    fn test_summary_keeps_loaded_messages() {
        let cache = cache();
        let mut detailed = thread("a", Folder::Inbox, 0);
        detailed.message_ids = vec!["m1".to_string()];
        detailed.messages = Some(vec![crate::model::MessageBuilder::new().id("m1").read(true).build()]);
        cache.store_threads(vec![detailed.clone()], cache.begin_fetch());

        cache.store_threads(vec![detailed.summary()], cache.begin_fetch());
        assert!(cache.snapshot().thread("a").unwrap().messages.is_some());
    }

    #[test]
    fn test_evict_removes_from_every_view() {
        let cache = cache();
        let inbox = ViewKey::folder(Folder::Inbox);
        let search = ViewKey::search(Folder::Inbox, "x");
        for view in [&inbox, &search] {
            let t = cache.begin_fetch();
            cache.store_page(view, &page(vec![thread("a", Folder::Inbox, 0)], None), t, false);
        }

        cache.evict("a");
        let snap = cache.snapshot();
        assert!(snap.view_ids(&inbox).is_empty());
        assert!(snap.view_ids(&search).is_empty());
        assert!(!snap.contains("a"));
    }

    #[tokio::test]
    async fn test_updates_are_published() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let cache = ThreadCache::new(Arc::clone(&events));
        let inbox = ViewKey::folder(Folder::Inbox);

        let t = cache.begin_fetch();
        cache.store_page(&inbox, &page(vec![thread("a", Folder::Inbox, 0)], None), t, false);

        assert_eq!(
            rx.recv().await.unwrap(),
            StateEvent::ThreadsChanged(vec!["a".to_string()])
        );
        assert_eq!(rx.recv().await.unwrap(), StateEvent::ViewChanged(inbox));
    }
}
