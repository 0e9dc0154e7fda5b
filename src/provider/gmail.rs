//! Gmail REST adapter: labels double as folders and flags.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use super::compose::compose;
use super::gmail_api::{GmailApi, GmailError, RawLabel, RawMessage, RawThread, ThreadListRequest};
use crate::model::{
    ChangeSet, Draft, Folder, Identity, Label, LabelId, LabelKind, LabelSpec, Message, MessageId,
    Thread, ThreadId, ThreadPage, ThreadPatch, system_labels,
};
use crate::parse::{HeaderFields, parse_rfc822};

/// Thread fetches kept in flight while filling one list page
const LIST_FETCH_CONCURRENCY: usize = 8;

/// Search expression for archived mail (Gmail has no archive label)
const ARCHIVE_QUERY: &str = "-in:inbox -in:spam -in:trash -in:drafts";

/// Gmail adapter over a [`GmailApi`] client
pub struct GmailAdapter {
    api: Arc<dyn GmailApi>,
    identity: Identity,
}

impl GmailAdapter {
    pub fn new(api: Arc<dyn GmailApi>, identity: Identity) -> Self {
        Self { api, identity }
    }

    fn list_request(
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> ThreadListRequest {
        let (label, base_query) = match folder {
            Folder::Inbox => (Some(system_labels::INBOX), None),
            Folder::Spam => (Some(system_labels::SPAM), None),
            Folder::Bin => (Some(system_labels::TRASH), None),
            Folder::Sent => (Some(system_labels::SENT), None),
            Folder::Drafts => (Some(system_labels::DRAFT), None),
            Folder::Archive => (None, Some(ARCHIVE_QUERY)),
        };

        let query = match (base_query, query.filter(|q| !q.trim().is_empty())) {
            (Some(base), Some(user)) => Some(format!("{base} {user}")),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(user)) => Some(user.to_string()),
            (None, None) => None,
        };

        ThreadListRequest {
            label_ids: label.map(|l| vec![l.to_string()]).unwrap_or_default(),
            query,
            page_token: page_token.map(str::to_string),
            max_results: page_size.max(1),
            include_spam_trash: matches!(folder, Folder::Spam | Folder::Bin),
        }
    }

    pub async fn list_threads(
        &self,
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ThreadPage, GmailError> {
        let request = Self::list_request(folder, query, page_token, page_size);
        debug!("gmail: list_threads {:?}", request);
        let listing = self.api.list_threads(request).await?;

        let count = listing.thread_ids.len();
        let limit = Arc::new(Semaphore::new(LIST_FETCH_CONCURRENCY));
        let mut fetches = JoinSet::new();
        for (index, id) in listing.thread_ids.into_iter().enumerate() {
            let api = Arc::clone(&self.api);
            let limit = Arc::clone(&limit);
            fetches.spawn(async move {
                let _permit = limit.acquire_owned().await;
                (index, id.clone(), api.get_thread(id, false).await)
            });
        }

        let mut slots: Vec<Option<Thread>> = vec![None; count];
        while let Some(joined) = fetches.join_next().await {
            let (index, id, result) =
                joined.map_err(|e| GmailError::Transport(format!("thread fetch task failed: {e}")))?;
            match result {
                Ok(raw) => slots[index] = Some(normalize_thread(raw, false)),
                // Deleted between the list and the fetch
                Err(GmailError::Http { status: 404, .. }) => {
                    debug!("gmail: thread {} vanished while listing", id);
                }
                Err(e) => return Err(e),
            }
        }
        let threads: Vec<Thread> = slots.into_iter().flatten().collect();

        Ok(ThreadPage {
            threads,
            next_page_token: listing.next_page_token,
        })
    }

    pub async fn get_thread(&self, id: &str) -> Result<Thread, GmailError> {
        let raw = self.api.get_thread(id.to_string(), true).await?;
        Ok(normalize_thread(raw, true))
    }

    pub async fn send_message(&self, draft: &Draft) -> Result<MessageId, GmailError> {
        // Gmail derives Bcc delivery from the header and strips it itself
        let composed = compose(draft, &self.identity, true)?;
        debug!(
            "gmail: sending {} to {} recipient(s)",
            composed.message_id, composed.recipient_count
        );
        self.api
            .send_raw(composed.raw(), draft.thread_id.clone())
            .await
    }

    pub async fn modify_labels(
        &self,
        thread_ids: &[ThreadId],
        add: &[LabelId],
        remove: &[LabelId],
    ) -> Result<(), GmailError> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }

        for id in thread_ids {
            self.api
                .modify_thread(id.clone(), add.to_vec(), remove.to_vec())
                .await?;
        }
        Ok(())
    }

    pub async fn move_threads(
        &self,
        thread_ids: &[ThreadId],
        destination: Option<Folder>,
    ) -> Result<(), GmailError> {
        let (add, remove) = move_label_delta(destination);
        self.modify_labels(thread_ids, &add, &remove).await
    }

    pub async fn set_read_state(&self, thread_ids: &[ThreadId], read: bool) -> Result<(), GmailError> {
        let unread = vec![system_labels::UNREAD.to_string()];
        if read {
            self.modify_labels(thread_ids, &[], &unread).await
        } else {
            self.modify_labels(thread_ids, &unread, &[]).await
        }
    }

    pub async fn list_labels(&self) -> Result<Vec<Label>, GmailError> {
        Ok(self
            .api
            .list_labels()
            .await?
            .into_iter()
            .filter_map(normalize_label)
            .collect())
    }

    pub async fn create_label(&self, spec: &LabelSpec) -> Result<Label, GmailError> {
        let created = self.api.create_label(raw_label(spec)).await?;
        normalize_label(created)
            .ok_or_else(|| GmailError::Malformed("created label has no id".to_string()))
    }

    pub async fn update_label(&self, id: &str, spec: &LabelSpec) -> Result<Label, GmailError> {
        let patched = self.api.patch_label(id.to_string(), raw_label(spec)).await?;
        normalize_label(patched)
            .ok_or_else(|| GmailError::Malformed("patched label has no id".to_string()))
    }

    pub async fn delete_label(&self, id: &str) -> Result<(), GmailError> {
        self.api.delete_label(id.to_string()).await
    }

    /// Current history id, used as the starting point for `changes_since`
    pub async fn sync_cursor(&self) -> Result<Option<String>, GmailError> {
        Ok(Some(self.api.current_history_id().await?.to_string()))
    }

    /// Walks the history since `cursor`, returning one patch per touched thread
    pub async fn changes_since(&self, cursor: &str) -> Result<ChangeSet, GmailError> {
        let start: u64 = cursor
            .parse()
            .map_err(|_| GmailError::StaleCursor(cursor.to_string()))?;

        let mut touched: Vec<String> = Vec::new();
        let mut latest = start;
        let mut page_token = None;
        loop {
            let page = self.api.history_since(start, page_token).await?;
            for id in page.thread_ids {
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
            if let Some(history_id) = page.history_id {
                latest = latest.max(history_id);
            }
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        debug!("gmail: {} thread(s) changed since {}", touched.len(), start);

        let mut patches = Vec::with_capacity(touched.len());
        for id in touched {
            match self.api.get_thread(id.clone(), false).await {
                Ok(raw) => patches.push(ThreadPatch::Upsert(normalize_thread(raw, false))),
                Err(GmailError::Http { status: 404, .. }) => patches.push(ThreadPatch::Remove(id)),
                Err(e) => return Err(e),
            }
        }

        Ok(ChangeSet {
            patches,
            cursor: latest.to_string(),
        })
    }
}

/// Labels to add and remove to land a thread in `destination`
fn move_label_delta(destination: Option<Folder>) -> (Vec<LabelId>, Vec<LabelId>) {
    use system_labels::{INBOX, SPAM, TRASH};

    let (add, remove): (&[&str], &[&str]) = match destination {
        Some(Folder::Inbox) | None => (&[INBOX], &[SPAM, TRASH]),
        Some(Folder::Archive) => (&[], &[INBOX, SPAM, TRASH]),
        Some(Folder::Spam) => (&[SPAM], &[INBOX, TRASH]),
        Some(Folder::Bin) => (&[TRASH], &[INBOX, SPAM]),
        // Not move targets; the driver rejects these before we get here
        Some(Folder::Sent) | Some(Folder::Drafts) => (&[], &[]),
    };

    (
        add.iter().map(|l| l.to_string()).collect(),
        remove.iter().map(|l| l.to_string()).collect(),
    )
}

/// Derives a thread's folder from the union of its message labels
fn folder_of(labels: &[String], messages: &[RawMessage]) -> Folder {
    let has = |label: &str| labels.iter().any(|l| l == label);
    let all = |label: &str| {
        !messages.is_empty() && messages.iter().all(|m| m.label_ids.iter().any(|l| l == label))
    };

    if has(system_labels::TRASH) {
        Folder::Bin
    } else if has(system_labels::SPAM) {
        Folder::Spam
    } else if has(system_labels::INBOX) {
        Folder::Inbox
    } else if all(system_labels::DRAFT) {
        Folder::Drafts
    } else if all(system_labels::SENT) {
        Folder::Sent
    } else {
        Folder::Archive
    }
}

fn header<'a>(message: &'a RawMessage, name: &str) -> Option<&'a str> {
    message
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn internal_date(message: &RawMessage) -> Option<DateTime<Utc>> {
    message
        .internal_date
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Canonical message from a Gmail message, preferring the raw source when present
fn normalize_message(raw: &RawMessage, thread_id: &str) -> Message {
    let read = !raw.label_ids.iter().any(|l| l == system_labels::UNREAD);
    let draft = raw.label_ids.iter().any(|l| l == system_labels::DRAFT);

    let mut message = match raw.raw.as_deref().and_then(|src| parse_rfc822(src, &raw.id, thread_id)) {
        Some(message) => message,
        None => {
            let headers = raw
                .headers
                .iter()
                .map(|(n, v)| format!("{n}: {v}\r\n"))
                .collect::<String>();
            HeaderFields::parse_block(headers.as_bytes())
                .into_builder()
                .id(raw.id.clone())
                .thread_id(thread_id)
                .build()
        }
    };

    message.read = read;
    message.draft = draft;
    if let Some(date) = internal_date(raw) {
        message.received_at = date;
    }
    message
}

/// Canonical thread from a Gmail thread resource
pub(crate) fn normalize_thread(raw: RawThread, with_messages: bool) -> Thread {
    let mut labels: Vec<String> = Vec::new();
    for message in &raw.messages {
        for label in &message.label_ids {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
    }

    let mut thread = Thread::new(raw.id.clone(), folder_of(&labels, &raw.messages));
    let has = |label: &str| labels.iter().any(|l| l == label);
    thread.unread = has(system_labels::UNREAD);
    thread.starred = has(system_labels::STARRED);
    thread.important = has(system_labels::IMPORTANT);
    for label in labels.iter().filter(|l| !system_labels::is_structural(l)) {
        thread.add_label(label);
    }

    thread.message_ids = raw.messages.iter().map(|m| m.id.clone()).collect();
    if let Some(last) = raw.messages.iter().filter_map(internal_date).max() {
        thread.last_activity = last;
    }
    if let Some(first) = raw.messages.first() {
        thread.subject = header(first, "Subject").unwrap_or_default().to_string();
    }
    if let Some(newest) = raw.messages.last() {
        thread.snippet = newest.snippet.clone();
        thread.from = header(newest, "From").unwrap_or_default().to_string();
    }

    if with_messages {
        let messages: Vec<Message> = raw
            .messages
            .iter()
            .map(|m| normalize_message(m, &raw.id))
            .collect();
        thread.messages = Some(messages);
        thread.sync_unread_from_messages();
    }

    thread
}

fn normalize_label(raw: RawLabel) -> Option<Label> {
    let id = raw.id?;
    let kind = match raw.kind.as_deref() {
        Some("system") => LabelKind::System,
        _ => LabelKind::User,
    };
    Some(Label {
        id,
        name: raw.name,
        kind,
        color: raw.color,
        category: None,
    })
}

fn raw_label(spec: &LabelSpec) -> RawLabel {
    RawLabel {
        id: None,
        name: spec.name.clone(),
        kind: None,
        color: spec.color.clone(),
    }
}

/// Helper used by tests and the in-memory backend to build a message resource
#[cfg(test)]
pub(crate) fn raw_message(id: &str, thread_id: &str, labels: &[&str], from: &str, subject: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
        snippet: format!("snippet of {id}"),
        internal_date: Some(1_700_000_000_000),
        headers: vec![
            ("From".to_string(), from.to_string()),
            ("To".to_string(), "me@example.com".to_string()),
            ("Subject".to_string(), subject.to_string()),
        ],
        raw: None,
    }
}
