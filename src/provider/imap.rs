//! IMAP/SMTP adapter.
//!
//! Canonical folders map onto per-account mailboxes, flags onto IMAP system
//! flags, and user labels onto IMAP keywords. IMAP has no conversations, so
//! threads are grouped with the union-find in [`crate::threading`] and keyed
//! by their root Message-ID. Page tokens pin the UID range the walk started
//! with so new arrivals never shift later pages.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::compose::compose;
use super::imap_session::{FetchedSummary, ImapError, ImapSession, MailboxInfo};
use super::smtp::SmtpTransport;
use crate::config::ImapFolderNames;
use crate::model::{
    ChangeSet, Draft, Folder, Identity, Label, LabelId, LabelSpec, Message, MessageId, Thread,
    ThreadId, ThreadPage, system_labels,
};
use crate::parse::{HeaderFields, parse_rfc822, snippet_of};
use crate::threading::{Threadable, assign_thread_keys, normalize_id};

const SEEN: &str = "\\Seen";
const FLAGGED: &str = "\\Flagged";
const DRAFT_FLAG: &str = "\\Draft";
const IMPORTANT_KEYWORD: &str = "$Important";

/// Folders searched, in order, when resolving a thread id to messages
const LOCATE_ORDER: [Folder; 5] = [
    Folder::Inbox,
    Folder::Spam,
    Folder::Bin,
    Folder::Archive,
    Folder::Sent,
];

/// Thread ids of messages without any usable threading header
const FALLBACK_PREFIX: &str = "anon:";

/// Matches messages that carry no Message-ID header
const WITHOUT_MESSAGE_ID: &str = "NOT HEADER Message-ID \"\"";

fn mailbox_for(folders: &ImapFolderNames, folder: Folder) -> &str {
    match folder {
        Folder::Inbox => &folders.inbox,
        Folder::Archive => &folders.archive,
        Folder::Spam => &folders.spam,
        Folder::Bin => &folders.bin,
        Folder::Sent => &folders.sent,
        Folder::Drafts => &folders.drafts,
    }
}

/// Quotes a string for use in a SEARCH command
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Keywords the server reserves or that we map to canonical flags
fn is_user_keyword(flag: &str) -> bool {
    !flag.is_empty() && !flag.starts_with('\\') && !flag.starts_with('$') && flag != "*"
}

/// Turns a label name into a valid IMAP keyword atom
fn keyword_for(name: &str) -> Result<String, ImapError> {
    let keyword: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if keyword.is_empty() {
        return Err(ImapError::InvalidRequest("label name is empty".to_string()));
    }
    Ok(keyword)
}

/// Paging position: the UIDVALIDITY and UID ceiling fixed on the first page,
/// plus the number of threads already returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageToken {
    uid_validity: u32,
    ceiling: u32,
    offset: usize,
}

impl PageToken {
    fn encode(&self) -> String {
        format!("v{}-c{}-o{}", self.uid_validity, self.ceiling, self.offset)
    }

    fn decode(raw: &str) -> Result<Self, ImapError> {
        let invalid = || ImapError::InvalidPageToken(raw.to_string());
        let parts: Vec<&str> = raw.split('-').collect();
        let [validity, ceiling, offset] = parts.as_slice() else {
            return Err(invalid());
        };

        Ok(Self {
            uid_validity: validity
                .strip_prefix('v')
                .and_then(|v| v.parse().ok())
                .ok_or_else(invalid)?,
            ceiling: ceiling
                .strip_prefix('c')
                .and_then(|c| c.parse().ok())
                .ok_or_else(invalid)?,
            offset: offset
                .strip_prefix('o')
                .and_then(|o| o.parse().ok())
                .ok_or_else(invalid)?,
        })
    }
}

/// A fetched summary with its headers parsed
struct Summary {
    folder: Folder,
    uid: u32,
    flags: Vec<String>,
    fields: HeaderFields,
    internal_date: Option<DateTime<Utc>>,
}

impl Summary {
    fn new(folder: Folder, fetched: FetchedSummary) -> Self {
        Self {
            folder,
            uid: fetched.uid,
            fields: HeaderFields::parse_block(&fetched.header),
            flags: fetched.flags,
            internal_date: fetched.internal_date,
        }
    }

    fn date(&self) -> Option<DateTime<Utc>> {
        self.fields.date.or(self.internal_date)
    }
}

impl Threadable for Summary {
    fn message_id(&self) -> Option<&str> {
        self.fields.message_id.as_deref()
    }

    fn in_reply_to(&self) -> Option<&str> {
        self.fields.in_reply_to.as_deref()
    }

    fn references(&self) -> &[String] {
        &self.fields.references
    }

    fn fallback_key(&self) -> String {
        content_key(&self.fields)
    }
}

/// Id for a message with no threading headers, from headers that stay the
/// same whichever mailbox it is filed in
fn content_key(fields: &HeaderFields) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fields.from.as_bytes());
    hasher.update([0]);
    hasher.update(fields.subject.as_bytes());
    hasher.update([0]);
    if let Some(date) = fields.date {
        hasher.update(date.timestamp().to_be_bytes());
    }
    let digest = hasher.finalize();
    format!("{FALLBACK_PREFIX}{}", hex::encode(&digest[..12]))
}

fn message_key(folder: Folder, uid: u32) -> MessageId {
    format!("{folder}/{uid}")
}

/// Applies the union of the messages' flags to a thread
fn apply_flags<'a>(thread: &mut Thread, flag_sets: impl Iterator<Item = &'a [String]>) {
    let mut any_unseen = false;
    for flags in flag_sets {
        let has = |flag: &str| flags.iter().any(|f| f.eq_ignore_ascii_case(flag));
        any_unseen |= !has(SEEN);
        thread.starred |= has(FLAGGED);
        thread.important |= has(IMPORTANT_KEYWORD);
        for keyword in flags.iter().filter(|f| is_user_keyword(f)) {
            thread.add_label(keyword);
        }
    }
    thread.unread = any_unseen;
}

/// Groups summaries into threads, newest activity first
fn group_threads(summaries: Vec<Summary>, folder: Folder) -> Vec<Thread> {
    let keys = assign_thread_keys(&summaries);

    let mut groups: HashMap<String, Vec<Summary>> = HashMap::new();
    for (key, summary) in keys.into_iter().zip(summaries) {
        groups.entry(key).or_default().push(summary);
    }

    let mut threads: Vec<(u32, Thread)> = groups
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by_key(|m| m.uid);
            let newest_uid = members.last().map(|m| m.uid).unwrap_or_default();

            let mut thread = Thread::new(key, folder);
            apply_flags(&mut thread, members.iter().map(|m| m.flags.as_slice()));
            thread.message_ids = members.iter().map(|m| message_key(m.folder, m.uid)).collect();
            if let Some(latest) = members.iter().filter_map(Summary::date).max() {
                thread.last_activity = latest;
            }
            if let Some(first) = members.first() {
                thread.subject = first.fields.subject.clone();
            }
            if let Some(newest) = members.last() {
                thread.from = newest.fields.from.clone();
                // Summaries carry no body, so the subject stands in for the snippet
                thread.snippet = snippet_of(&newest.fields.subject);
            }
            (newest_uid, thread)
        })
        .collect();

    threads.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    threads.into_iter().map(|(_, thread)| thread).collect()
}

/// Messages of one thread within one folder
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    folder: Folder,
    uids: Vec<u32>,
}

/// Flag changes for a label delta: `(flags to add, flags to remove)`
fn flag_delta(add: &[LabelId], remove: &[LabelId]) -> Result<(Vec<String>, Vec<String>), ImapError> {
    let mut plus = Vec::new();
    let mut minus = Vec::new();

    for (labels, adding) in [(add, true), (remove, false)] {
        for label in labels {
            let (flag, set) = match label.as_str() {
                system_labels::UNREAD => (SEEN.to_string(), !adding),
                system_labels::STARRED => (FLAGGED.to_string(), adding),
                system_labels::IMPORTANT => (IMPORTANT_KEYWORD.to_string(), adding),
                other if system_labels::is_structural(other) => {
                    return Err(ImapError::InvalidRequest(format!(
                        "'{other}' is a folder on IMAP; move the thread instead"
                    )));
                }
                other => (keyword_for(other)?, adding),
            };
            let target = if set { &mut plus } else { &mut minus };
            if !target.contains(&flag) {
                target.push(flag);
            }
        }
    }

    Ok((plus, minus))
}

/// Mailbox operations over one borrowed session
struct Mailstore<'a> {
    session: &'a mut dyn ImapSession,
    folders: &'a ImapFolderNames,
}

impl Mailstore<'_> {
    fn select(&mut self, folder: Folder) -> Result<MailboxInfo, ImapError> {
        let mailbox = mailbox_for(self.folders, folder);
        debug!("imap: select {}", mailbox);
        self.session.select(mailbox)
    }

    fn list_page(
        &mut self,
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ThreadPage, ImapError> {
        let info = self.select(folder)?;
        let uid_validity = info.uid_validity.unwrap_or_default();

        let token = match page_token {
            Some(raw) => {
                let token = PageToken::decode(raw)?;
                if token.uid_validity != uid_validity {
                    return Err(ImapError::UidValidityChanged {
                        mailbox: mailbox_for(self.folders, folder).to_string(),
                    });
                }
                token
            }
            None => PageToken {
                uid_validity,
                ceiling: info
                    .uid_next
                    .map(|next| next.saturating_sub(1))
                    .unwrap_or(u32::MAX),
                offset: 0,
            },
        };

        if info.exists == 0 || token.ceiling == 0 {
            return Ok(ThreadPage::default());
        }

        let mut criteria = format!("UID 1:{}", token.ceiling);
        if let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) {
            criteria.push_str(&format!(" TEXT {}", quote(query)));
        }

        let uids = self.session.uid_search(&criteria)?;
        let summaries = self
            .session
            .fetch_summaries(&uids)?
            .into_iter()
            .map(|fetched| Summary::new(folder, fetched))
            .collect();

        let threads = group_threads(summaries, folder);
        let page_size = page_size.max(1) as usize;
        let end = token.offset.saturating_add(page_size);
        let next_page_token = (end < threads.len()).then(|| {
            PageToken {
                offset: end,
                ..token
            }
            .encode()
        });

        debug!(
            "imap: {} thread(s) in {} up to UID {}, returning offset {}",
            threads.len(),
            folder,
            token.ceiling,
            token.offset
        );

        Ok(ThreadPage {
            threads: threads.into_iter().skip(token.offset).take(page_size).collect(),
            next_page_token,
        })
    }

    /// Finds every message of a thread, per folder
    fn locate(&mut self, thread_id: &str) -> Result<Vec<Location>, ImapError> {
        if thread_id.starts_with(FALLBACK_PREFIX) {
            return self.locate_anonymous(thread_id);
        }

        let root = quote(&format!("<{}>", normalize_id(thread_id)));
        let criteria = format!("OR HEADER Message-ID {root} HEADER References {root}");

        let mut locations = Vec::new();
        for folder in LOCATE_ORDER {
            let info = self.select(folder)?;
            if info.exists == 0 {
                continue;
            }
            let uids = self.session.uid_search(&criteria)?;
            if !uids.is_empty() {
                locations.push(Location { folder, uids });
            }
        }

        if locations.is_empty() {
            return Err(ImapError::NotFound(thread_id.to_string()));
        }
        Ok(locations)
    }

    /// Headerless messages are matched by recomputing their content key
    fn locate_anonymous(&mut self, thread_id: &str) -> Result<Vec<Location>, ImapError> {
        let mut locations = Vec::new();
        for folder in LOCATE_ORDER {
            let info = self.select(folder)?;
            if info.exists == 0 {
                continue;
            }
            let candidates = self.session.uid_search(WITHOUT_MESSAGE_ID)?;
            if candidates.is_empty() {
                continue;
            }

            let uids: Vec<u32> = self
                .session
                .fetch_summaries(&candidates)?
                .into_iter()
                .map(|fetched| Summary::new(folder, fetched))
                .filter(|summary| summary.fallback_key() == thread_id)
                .map(|summary| summary.uid)
                .collect();
            if !uids.is_empty() {
                locations.push(Location { folder, uids });
            }
        }

        if locations.is_empty() {
            return Err(ImapError::NotFound(thread_id.to_string()));
        }
        Ok(locations)
    }

    fn load_thread(&mut self, thread_id: &str) -> Result<Thread, ImapError> {
        let locations = self.locate(thread_id)?;
        let folder = locations[0].folder;

        let mut messages: Vec<Message> = Vec::new();
        let mut flag_sets: Vec<Vec<String>> = Vec::new();
        for location in &locations {
            self.select(location.folder)?;
            for fetched in self.session.fetch_bodies(&location.uids)? {
                let id = message_key(location.folder, fetched.uid);
                let Some(mut message) = parse_rfc822(&fetched.raw, &id, thread_id) else {
                    warn!("imap: skipping unparseable message {}", id);
                    continue;
                };

                // Mailboxes like Gmail's All Mail repeat messages found elsewhere
                if message.message_id.is_some()
                    && messages.iter().any(|m| m.message_id == message.message_id)
                {
                    continue;
                }

                let has = |flag: &str| fetched.flags.iter().any(|f| f.eq_ignore_ascii_case(flag));
                message.read = has(SEEN);
                message.draft = has(DRAFT_FLAG);
                if let Some(date) = fetched.internal_date {
                    message.received_at = date;
                }
                flag_sets.push(fetched.flags);
                messages.push(message);
            }
        }

        if messages.is_empty() {
            return Err(ImapError::NotFound(thread_id.to_string()));
        }
        messages.sort_by_key(|m| m.received_at);

        let mut thread = Thread::new(thread_id, folder);
        apply_flags(&mut thread, flag_sets.iter().map(Vec::as_slice));
        thread.message_ids = messages.iter().map(|m| m.id.clone()).collect();
        if let Some(first) = messages.first() {
            thread.subject = first.subject.clone();
        }
        if let Some(newest) = messages.last() {
            thread.from = newest.from.to_string();
            thread.last_activity = newest.received_at;
            thread.snippet = newest
                .body
                .text
                .as_deref()
                .map(snippet_of)
                .unwrap_or_else(|| snippet_of(&newest.subject));
        }
        thread.messages = Some(messages);
        thread.sync_unread_from_messages();
        Ok(thread)
    }

    fn store_flags(
        &mut self,
        thread_ids: &[ThreadId],
        plus: &[String],
        minus: &[String],
    ) -> Result<(), ImapError> {
        if plus.is_empty() && minus.is_empty() {
            return Ok(());
        }

        for thread_id in thread_ids {
            for location in self.locate(thread_id)? {
                self.select(location.folder)?;
                // STORE of a flag already present (or absent) is a no-op server side
                if !plus.is_empty() {
                    self.session
                        .uid_store(&location.uids, &format!("+FLAGS.SILENT ({})", plus.join(" ")))?;
                }
                if !minus.is_empty() {
                    self.session
                        .uid_store(&location.uids, &format!("-FLAGS.SILENT ({})", minus.join(" ")))?;
                }
            }
        }
        Ok(())
    }

    fn move_threads(&mut self, thread_ids: &[ThreadId], destination: Folder) -> Result<(), ImapError> {
        let target = mailbox_for(self.folders, destination).to_string();

        for thread_id in thread_ids {
            for location in self.locate(thread_id)? {
                // Already there, or a copy we never move (Sent)
                if location.folder == destination || !location.folder.is_move_target() {
                    continue;
                }
                self.select(location.folder)?;
                debug!(
                    "imap: moving {} message(s) of {} from {} to {}",
                    location.uids.len(),
                    thread_id,
                    location.folder,
                    target
                );
                self.session.uid_move(&location.uids, &target)?;
            }
        }
        Ok(())
    }

    /// Keywords in use across the move-target folders
    fn keywords(&mut self) -> Result<BTreeSet<String>, ImapError> {
        let mut keywords = BTreeSet::new();
        for folder in [Folder::Inbox, Folder::Archive] {
            let info = self.select(folder)?;
            keywords.extend(info.flags.into_iter().filter(|f| is_user_keyword(f)));
        }
        Ok(keywords)
    }

    /// Replaces `old` with `new` on every message carrying it; `None` just removes it
    fn rewrite_keyword(&mut self, old: &str, new: Option<&str>) -> Result<(), ImapError> {
        for folder in [Folder::Inbox, Folder::Archive, Folder::Spam, Folder::Bin] {
            let info = self.select(folder)?;
            if info.exists == 0 {
                continue;
            }
            let uids = self.session.uid_search(&format!("KEYWORD {old}"))?;
            if uids.is_empty() {
                continue;
            }
            if let Some(new) = new {
                self.session
                    .uid_store(&uids, &format!("+FLAGS.SILENT ({new})"))?;
            }
            self.session
                .uid_store(&uids, &format!("-FLAGS.SILENT ({old})"))?;
        }
        Ok(())
    }
}

/// IMAP adapter; blocking session work runs on the blocking thread pool
pub struct ImapAdapter {
    session: Arc<Mutex<Box<dyn ImapSession>>>,
    smtp: Arc<dyn SmtpTransport>,
    folders: Arc<ImapFolderNames>,
    identity: Identity,
    /// Keywords created here that no message carries yet
    created_keywords: RwLock<BTreeSet<String>>,
}

impl ImapAdapter {
    pub fn new(
        session: Box<dyn ImapSession>,
        smtp: Arc<dyn SmtpTransport>,
        folders: ImapFolderNames,
        identity: Identity,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            smtp,
            folders: Arc::new(folders),
            identity,
            created_keywords: RwLock::new(BTreeSet::new()),
        }
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, ImapError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Mailstore<'_>) -> Result<T, ImapError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let folders = Arc::clone(&self.folders);
        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock();
            let mut store = Mailstore {
                session: &mut **guard,
                folders: &folders,
            };
            op(&mut store)
        })
        .await
        .map_err(|e| ImapError::Connection(format!("IMAP worker failed: {e}")))?
    }

    pub async fn list_threads(
        &self,
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ThreadPage, ImapError> {
        let query = query.map(str::to_string);
        let page_token = page_token.map(str::to_string);
        self.with_store(move |store| {
            store.list_page(folder, query.as_deref(), page_token.as_deref(), page_size)
        })
        .await
    }

    pub async fn get_thread(&self, id: &str) -> Result<Thread, ImapError> {
        let id = id.to_string();
        self.with_store(move |store| store.load_thread(&id)).await
    }

    /// Submits over SMTP, then files a copy in Sent
    pub async fn send_message(&self, draft: &Draft) -> Result<MessageId, ImapError> {
        let composed = compose(draft, &self.identity, false)?;
        let raw = composed.raw();
        let message_id = normalize_id(&composed.message_id);

        self.smtp.send(composed.message).await?;

        // The message is out; failing to file the copy must not trigger a resend
        let filed = self
            .with_store(move |store| {
                let sent = mailbox_for(store.folders, Folder::Sent).to_string();
                store.session.append(&sent, &raw, true)
            })
            .await;
        if let Err(e) = filed {
            warn!("imap: sent {} but could not append it to Sent: {}", message_id, e);
        }

        Ok(message_id)
    }

    pub async fn modify_labels(
        &self,
        thread_ids: &[ThreadId],
        add: &[LabelId],
        remove: &[LabelId],
    ) -> Result<(), ImapError> {
        let (plus, minus) = flag_delta(add, remove)?;
        let thread_ids = thread_ids.to_vec();
        self.with_store(move |store| store.store_flags(&thread_ids, &plus, &minus))
            .await
    }

    pub async fn move_threads(
        &self,
        thread_ids: &[ThreadId],
        destination: Option<Folder>,
    ) -> Result<(), ImapError> {
        let destination = destination.unwrap_or(Folder::Inbox);
        let thread_ids = thread_ids.to_vec();
        self.with_store(move |store| store.move_threads(&thread_ids, destination))
            .await
    }

    pub async fn set_read_state(&self, thread_ids: &[ThreadId], read: bool) -> Result<(), ImapError> {
        let seen = vec![SEEN.to_string()];
        let (plus, minus) = if read {
            (seen, Vec::new())
        } else {
            (Vec::new(), seen)
        };
        let thread_ids = thread_ids.to_vec();
        self.with_store(move |store| store.store_flags(&thread_ids, &plus, &minus))
            .await
    }

    pub async fn list_labels(&self) -> Result<Vec<Label>, ImapError> {
        let mut keywords = self.with_store(|store| store.keywords()).await?;
        keywords.extend(self.created_keywords.read().iter().cloned());

        let mut labels = vec![
            Label::system(system_labels::INBOX, "Inbox"),
            Label::system(system_labels::SPAM, "Spam"),
            Label::system(system_labels::TRASH, "Bin"),
            Label::system(system_labels::SENT, "Sent"),
            Label::system(system_labels::DRAFT, "Drafts"),
            Label::system(system_labels::UNREAD, "Unread"),
            Label::system(system_labels::STARRED, "Starred"),
            Label::system(system_labels::IMPORTANT, "Important"),
        ];
        labels.extend(keywords.into_iter().map(|k| Label::user(k.clone(), k)));
        Ok(labels)
    }

    pub async fn create_label(&self, spec: &LabelSpec) -> Result<Label, ImapError> {
        let keyword = keyword_for(&spec.name)?;
        self.created_keywords.write().insert(keyword.clone());
        Ok(Label {
            color: spec.color.clone(),
            ..Label::user(keyword, spec.name.clone())
        })
    }

    pub async fn update_label(&self, id: &str, spec: &LabelSpec) -> Result<Label, ImapError> {
        let old = keyword_for(id)?;
        let new = keyword_for(&spec.name)?;

        if old != new {
            let (from, to) = (old.clone(), new.clone());
            self.with_store(move |store| store.rewrite_keyword(&from, Some(&to)))
                .await?;
            let mut created = self.created_keywords.write();
            created.remove(&old);
            created.insert(new.clone());
        }

        Ok(Label {
            color: spec.color.clone(),
            ..Label::user(new, spec.name.clone())
        })
    }

    pub async fn delete_label(&self, id: &str) -> Result<(), ImapError> {
        let keyword = keyword_for(id)?;
        self.created_keywords.write().remove(&keyword);
        self.with_store(move |store| store.rewrite_keyword(&keyword, None))
            .await
    }

    /// IMAP offers no change feed; callers poll instead
    pub async fn sync_cursor(&self) -> Result<Option<String>, ImapError> {
        Ok(None)
    }

    pub async fn changes_since(&self, _cursor: &str) -> Result<ChangeSet, ImapError> {
        Err(ImapError::InvalidRequest(
            "IMAP accounts have no change feed".to_string(),
        ))
    }

    pub async fn logout(&self) -> Result<(), ImapError> {
        self.with_store(|store| store.session.logout()).await
    }
}
