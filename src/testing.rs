//! In-memory Gmail backend for exercising the whole stack in tests.
//!
//! Threads are plain label sets like the real service; history records one
//! entry per change so cursor sync behaves like `users.history.list`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::auth::StaticSession;
use crate::client::MailClient;
use crate::config::{NoLabelSettings, RetryPolicy, SyncSettings};
use crate::driver::MailDriver;
use crate::model::{AccountConnection, CredentialRef, Identity, ProviderKind, system_labels};
use crate::provider::ProviderAdapter;
use crate::provider::gmail::{GmailAdapter, raw_message};
use crate::provider::gmail_api::{
    GmailApi, GmailError, RawHistoryPage, RawLabel, RawMessage, RawThread, RawThreadList,
    ThreadListRequest,
};

const ACCOUNT: &str = "fake";
const SYSTEM_LABELS: [&str; 8] = [
    system_labels::INBOX,
    system_labels::SPAM,
    system_labels::TRASH,
    system_labels::SENT,
    system_labels::DRAFT,
    system_labels::UNREAD,
    system_labels::STARRED,
    system_labels::IMPORTANT,
];

#[derive(Default)]
struct FakeState {
    threads: BTreeMap<String, Vec<RawMessage>>,
    user_labels: Vec<RawLabel>,
    history_id: u64,
    history: Vec<(u64, String)>,
    history_floor: u64,
    clock: i64,
    next_id: u64,
    modify_failures: VecDeque<GmailError>,
    get_failures: VecDeque<GmailError>,
    modify_calls: usize,
}

impl FakeState {
    fn record(&mut self, thread_id: &str) {
        self.history_id += 1;
        self.history.push((self.history_id, thread_id.to_string()));
    }

    fn tick(&mut self) -> i64 {
        self.clock += 60_000;
        self.clock
    }

    fn labels_of(&self, thread_id: &str) -> Vec<String> {
        let mut labels: Vec<String> = self
            .threads
            .get(thread_id)
            .into_iter()
            .flatten()
            .flat_map(|m| m.label_ids.iter().cloned())
            .collect();
        labels.sort();
        labels.dedup();
        labels
    }

    fn relabel(&mut self, thread_id: &str, add: &[String], remove: &[String]) -> bool {
        let Some(messages) = self.threads.get_mut(thread_id) else {
            return false;
        };
        for message in messages.iter_mut() {
            for label in add {
                if !message.label_ids.contains(label) {
                    message.label_ids.push(label.clone());
                }
            }
            message.label_ids.retain(|l| !remove.contains(l));
        }
        self.record(thread_id);
        true
    }

    fn newest(&self, thread_id: &str) -> i64 {
        self.threads
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter_map(|m| m.internal_date)
            .max()
            .unwrap_or(0)
    }
}

fn not_found(what: &str) -> GmailError {
    GmailError::Http {
        status: 404,
        reason: Some("notFound".to_string()),
        message: format!("Requested entity was not found: {what}"),
        retry_after: None,
    }
}

/// Maps an `in:` search operand to the label it names
fn label_for(operand: &str) -> String {
    match operand {
        "inbox" => system_labels::INBOX.to_string(),
        "spam" => system_labels::SPAM.to_string(),
        "trash" => system_labels::TRASH.to_string(),
        "drafts" => system_labels::DRAFT.to_string(),
        "sent" => system_labels::SENT.to_string(),
        other => other.to_ascii_uppercase(),
    }
}

fn matches(labels: &[String], messages: &[RawMessage], request: &ThreadListRequest) -> bool {
    let has = |label: &str| labels.iter().any(|l| l == label);

    if !request.label_ids.iter().all(|l| has(l)) {
        return false;
    }
    if !request.include_spam_trash && (has(system_labels::SPAM) || has(system_labels::TRASH)) {
        return false;
    }

    request.query.as_deref().unwrap_or_default().split_whitespace().all(|term| {
        if let Some(operand) = term.strip_prefix("-in:") {
            !has(&label_for(operand))
        } else if let Some(operand) = term.strip_prefix("in:") {
            has(&label_for(operand))
        } else {
            let term = term.to_ascii_lowercase();
            messages.iter().any(|m| {
                m.headers
                    .iter()
                    .any(|(n, v)| n == "Subject" && v.to_ascii_lowercase().contains(&term))
            })
        }
    })
}

#[derive(Default)]
struct Inner {
    state: Mutex<FakeState>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// Cloneable handle; the driver and the test share one backend
#[derive(Clone, Default)]
pub struct FakeGmail {
    inner: Arc<Inner>,
}

impl FakeGmail {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.inner.state.lock().history_id = 100;
        fake
    }

    /// Adds a one-message thread, newer than every thread added before it
    pub fn add_thread(&self, id: &str, labels: &[&str]) {
        let mut state = self.inner.state.lock();
        let mut message = raw_message(
            &format!("{id}.1"),
            id,
            labels,
            &format!("Sender <{id}@example.com>"),
            &format!("Subject {id}"),
        );
        message.internal_date = Some(state.tick());
        state.threads.insert(id.to_string(), vec![message]);
        state.record(id);
    }

    /// Changes labels out from under the client, as another device would
    pub fn set_labels(&self, id: &str, add: &[&str], remove: &[&str]) {
        let add: Vec<String> = add.iter().map(|l| l.to_string()).collect();
        let remove: Vec<String> = remove.iter().map(|l| l.to_string()).collect();
        self.inner.state.lock().relabel(id, &add, &remove);
    }

    pub fn delete_thread(&self, id: &str) {
        let mut state = self.inner.state.lock();
        if state.threads.remove(id).is_some() {
            state.record(id);
        }
    }

    pub fn labels_of(&self, id: &str) -> Vec<String> {
        self.inner.state.lock().labels_of(id)
    }

    pub fn history_id(&self) -> u64 {
        self.inner.state.lock().history_id
    }

    /// History older than now is no longer served
    pub fn expire_history(&self) {
        let mut state = self.inner.state.lock();
        state.history_floor = state.history_id;
        state.history.clear();
    }

    /// Every read call sleeps this long first
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = Some(delay);
    }

    /// Holds label changes until permits are added to the returned semaphore
    pub fn hold_mutations(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.inner.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_next_modify(&self, error: GmailError) {
        self.inner.state.lock().modify_failures.push_back(error);
    }

    /// Fails the next thread reads, in order
    pub fn fail_next_get(&self, error: GmailError) {
        self.inner.state.lock().get_failures.push_back(error);
    }

    pub fn modify_calls(&self) -> usize {
        self.inner.state.lock().modify_calls
    }

    pub fn identity() -> Identity {
        Identity {
            email: "me@example.com".to_string(),
            name: Some("Me".to_string()),
        }
    }

    pub fn connection() -> AccountConnection {
        Self::connection_as(ACCOUNT)
    }

    fn connection_as(id: &str) -> AccountConnection {
        AccountConnection {
            id: id.to_string(),
            provider: ProviderKind::Gmail,
            credentials: CredentialRef::OAuthTokenCache("/dev/null".into()),
            identity: Self::identity(),
        }
    }

    /// Driver with this backend as the active connection
    pub fn driver(&self, retry: RetryPolicy) -> MailDriver {
        let session = Arc::new(StaticSession::new(
            Some("me@example.com".to_string()),
            Some(ACCOUNT.to_string()),
        ));
        let driver = MailDriver::new(session, Arc::new(NoLabelSettings), retry);
        self.attach(&driver, ACCOUNT);
        driver
    }

    /// Registers this backend on `driver` as account `id`
    pub fn attach(&self, driver: &MailDriver, id: &str) {
        let adapter = GmailAdapter::new(Arc::new(self.clone()), Self::identity());
        driver
            .connect(Self::connection_as(id), ProviderAdapter::Gmail(adapter))
            .expect("fake connection is a Gmail connection");
    }

    pub fn sync_settings() -> SyncSettings {
        SyncSettings {
            poll_interval_secs: 30,
            page_size: 10,
        }
    }

    pub fn client(&self, retry: RetryPolicy) -> MailClient {
        MailClient::new(Arc::new(self.driver(retry)), Self::sync_settings())
    }

    async fn pause(&self) {
        let delay = *self.inner.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn wait_for_gate(&self) {
        let gate = self.inner.gate.lock().clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }
}

#[async_trait]
impl GmailApi for FakeGmail {
    async fn list_threads(&self, request: ThreadListRequest) -> Result<RawThreadList, GmailError> {
        self.pause().await;
        let state = self.inner.state.lock();

        let mut hits: Vec<(i64, String)> = state
            .threads
            .iter()
            .filter(|(id, messages)| matches(&state.labels_of(id), messages, &request))
            .map(|(id, _)| (state.newest(id), id.clone()))
            .collect();
        hits.sort_by(|a, b| b.cmp(a));

        let offset = match request.page_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| GmailError::StaleCursor(token.to_string()))?,
            None => 0,
        };
        let end = (offset + request.max_results.max(1) as usize).min(hits.len());
        let start = offset.min(end);

        Ok(RawThreadList {
            thread_ids: hits[start..end].iter().map(|(_, id)| id.clone()).collect(),
            next_page_token: (end < hits.len()).then(|| end.to_string()),
        })
    }

    async fn get_thread(&self, id: String, _with_bodies: bool) -> Result<RawThread, GmailError> {
        self.pause().await;
        let mut state = self.inner.state.lock();
        if let Some(error) = state.get_failures.pop_front() {
            return Err(error);
        }
        let messages = state.threads.get(&id).cloned().ok_or_else(|| not_found(&id))?;
        Ok(RawThread {
            id,
            history_id: Some(state.history_id),
            messages,
        })
    }

    async fn modify_thread(
        &self,
        id: String,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<(), GmailError> {
        self.wait_for_gate().await;
        let mut state = self.inner.state.lock();
        state.modify_calls += 1;
        if let Some(error) = state.modify_failures.pop_front() {
            return Err(error);
        }
        if state.relabel(&id, &add, &remove) {
            Ok(())
        } else {
            Err(not_found(&id))
        }
    }

    async fn send_raw(&self, _raw: Vec<u8>, thread_id: Option<String>) -> Result<String, GmailError> {
        let mut state = self.inner.state.lock();
        state.next_id += 1;
        let thread_id = thread_id.unwrap_or_else(|| format!("sent-{}", state.next_id));
        let id = format!("{}.sent{}", thread_id, state.next_id);

        let mut message = raw_message(&id, &thread_id, &[system_labels::SENT], "Me <me@example.com>", "sent");
        message.internal_date = Some(state.tick());
        state.threads.entry(thread_id.clone()).or_default().push(message);
        state.record(&thread_id);
        Ok(id)
    }

    async fn history_since(
        &self,
        start: u64,
        _page_token: Option<String>,
    ) -> Result<RawHistoryPage, GmailError> {
        let state = self.inner.state.lock();
        if start < state.history_floor {
            return Err(GmailError::StaleCursor(start.to_string()));
        }

        let mut thread_ids: Vec<String> = Vec::new();
        for (_, id) in state.history.iter().filter(|(h, _)| *h > start) {
            if !thread_ids.contains(id) {
                thread_ids.push(id.clone());
            }
        }
        Ok(RawHistoryPage {
            thread_ids,
            history_id: Some(state.history_id),
            next_page_token: None,
        })
    }

    async fn current_history_id(&self) -> Result<u64, GmailError> {
        Ok(self.inner.state.lock().history_id)
    }

    async fn list_labels(&self) -> Result<Vec<RawLabel>, GmailError> {
        let state = self.inner.state.lock();
        let system = SYSTEM_LABELS.iter().map(|id| RawLabel {
            id: Some(id.to_string()),
            name: id.to_string(),
            kind: Some("system".to_string()),
            color: None,
        });
        Ok(system.chain(state.user_labels.iter().cloned()).collect())
    }

    async fn create_label(&self, label: RawLabel) -> Result<RawLabel, GmailError> {
        let mut state = self.inner.state.lock();
        if state.user_labels.iter().any(|l| l.name == label.name) {
            return Err(GmailError::Http {
                status: 409,
                reason: Some("duplicate".to_string()),
                message: "Label name exists or conflicts".to_string(),
                retry_after: None,
            });
        }
        state.next_id += 1;
        let created = RawLabel {
            id: Some(format!("Label_{}", state.next_id)),
            kind: Some("user".to_string()),
            ..label
        };
        state.user_labels.push(created.clone());
        Ok(created)
    }

    async fn patch_label(&self, id: String, label: RawLabel) -> Result<RawLabel, GmailError> {
        let mut state = self.inner.state.lock();
        let existing = state
            .user_labels
            .iter_mut()
            .find(|l| l.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| not_found(&id))?;
        existing.name = label.name;
        existing.color = label.color;
        Ok(existing.clone())
    }

    async fn delete_label(&self, id: String) -> Result<(), GmailError> {
        let mut state = self.inner.state.lock();
        let before = state.user_labels.len();
        state.user_labels.retain(|l| l.id.as_deref() != Some(id.as_str()));
        if state.user_labels.len() == before {
            return Err(not_found(&id));
        }
        for messages in state.threads.values_mut() {
            for message in messages {
                message.label_ids.retain(|l| *l != id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(labels: &[&str], query: Option<&str>, token: Option<&str>, max: u32) -> ThreadListRequest {
        ThreadListRequest {
            label_ids: labels.iter().map(|l| l.to_string()).collect(),
            query: query.map(str::to_string),
            page_token: token.map(str::to_string),
            max_results: max,
            include_spam_trash: false,
        }
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_and_paged() {
        let fake = FakeGmail::new();
        for id in ["a", "b", "c"] {
            fake.add_thread(id, &["INBOX"]);
        }

        let first = fake.list_threads(request(&["INBOX"], None, None, 2)).await.unwrap();
        assert_eq!(first.thread_ids, vec!["c", "b"]);
        let second = fake
            .list_threads(request(&["INBOX"], None, first.next_page_token.as_deref(), 2))
            .await
            .unwrap();
        assert_eq!(second.thread_ids, vec!["a"]);
        assert_eq!(second.next_page_token, None);
    }

    #[tokio::test]
    async fn test_archive_query_and_spam_exclusion() {
        let fake = FakeGmail::new();
        fake.add_thread("inbox", &["INBOX"]);
        fake.add_thread("archived", &["Label_1"]);
        fake.add_thread("spam", &["SPAM"]);

        let archive = fake
            .list_threads(request(&[], Some("-in:inbox -in:spam -in:trash -in:drafts"), None, 10))
            .await
            .unwrap();
        assert_eq!(archive.thread_ids, vec!["archived"]);
    }

    #[tokio::test]
    async fn test_history_tracks_changes_and_expires() {
        let fake = FakeGmail::new();
        fake.add_thread("a", &["INBOX"]);
        let cursor = fake.history_id();
        fake.set_labels("a", &["STARRED"], &[]);
        fake.add_thread("b", &["INBOX"]);

        let page = fake.history_since(cursor, None).await.unwrap();
        assert_eq!(page.thread_ids, vec!["a", "b"]);
        assert_eq!(page.history_id, Some(fake.history_id()));

        fake.expire_history();
        assert!(matches!(
            fake.history_since(cursor, None).await,
            Err(GmailError::StaleCursor(_))
        ));
        assert!(fake.history_since(fake.history_id(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_modify_is_idempotent_and_reports_missing_threads() {
        let fake = FakeGmail::new();
        fake.add_thread("a", &["INBOX"]);

        for _ in 0..2 {
            fake.modify_thread("a".to_string(), vec!["STARRED".to_string()], vec!["SPAM".to_string()])
                .await
                .unwrap();
        }
        assert_eq!(fake.labels_of("a"), vec!["INBOX", "STARRED"]);

        let err = fake
            .modify_thread("gone".to_string(), vec![], vec![])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}
