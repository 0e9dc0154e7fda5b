use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::parse::{extract_domain, extract_email};

pub type ThreadId = String;
pub type MessageId = String;
pub type LabelId = String;
pub type AccountId = String;

/// Canonical ids of the system labels every adapter understands
pub mod system_labels {
    pub const INBOX: &str = "INBOX";
    pub const SPAM: &str = "SPAM";
    pub const TRASH: &str = "TRASH";
    pub const SENT: &str = "SENT";
    pub const DRAFT: &str = "DRAFT";
    pub const UNREAD: &str = "UNREAD";
    pub const STARRED: &str = "STARRED";
    pub const IMPORTANT: &str = "IMPORTANT";

    /// Labels that are represented by `Thread::folder` or a thread flag
    /// rather than appearing in `Thread::labels`
    pub fn is_structural(id: &str) -> bool {
        matches!(
            id,
            INBOX | SPAM | TRASH | SENT | DRAFT | UNREAD | STARRED | IMPORTANT
        )
    }
}

/// Which backend an account connection talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// REST provider (Gmail API)
    Gmail,
    /// Generic IMAP + SMTP account
    Imap,
}

/// Where the account's secret material lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    /// OAuth tokens persisted by the installed-app flow
    OAuthTokenCache(PathBuf),
    /// Username plus a plain secret or an `op://` reference
    Password { username: String, secret: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub name: Option<String>,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

/// One authenticated mail account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConnection {
    pub id: AccountId,
    pub provider: ProviderKind,
    pub credentials: CredentialRef,
    pub identity: Identity,
}

/// Canonical mail location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Archive,
    Spam,
    Bin,
    Sent,
    Drafts,
}

impl Folder {
    pub const ALL: [Folder; 6] = [
        Folder::Inbox,
        Folder::Archive,
        Folder::Spam,
        Folder::Bin,
        Folder::Sent,
        Folder::Drafts,
    ];

    /// Only these folders may be the destination of a move
    pub fn is_move_target(self) -> bool {
        matches!(
            self,
            Folder::Inbox | Folder::Archive | Folder::Spam | Folder::Bin
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Archive => "archive",
            Folder::Spam => "spam",
            Folder::Bin => "bin",
            Folder::Sent => "sent",
            Folder::Drafts => "drafts",
        }
    }

    pub fn parse(name: &str) -> Option<Folder> {
        Folder::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open list view: a folder plus an optional search query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewKey {
    pub folder: Folder,
    pub query: Option<String>,
}

impl ViewKey {
    pub fn folder(folder: Folder) -> Self {
        Self {
            folder,
            query: None,
        }
    }

    pub fn search(folder: Folder, query: impl Into<String>) -> Self {
        Self {
            folder,
            query: Some(query.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub email: String,
}

impl Address {
    /// Parses `Name <user@host>` or a bare address
    pub fn parse(raw: &str) -> Self {
        let email = extract_email(raw);
        let name = raw
            .find('<')
            .map(|idx| raw[..idx].trim().trim_matches('"').to_string())
            .filter(|n| !n.is_empty());
        Self { name, email }
    }

    pub fn domain(&self) -> String {
        extract_domain(&self.email)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    /// The full RFC 5322 source, when the provider returned it
    pub raw: Option<Vec<u8>>,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// One email within a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body: Body,
    /// Headers kept for unsubscribe handling and transport-security evidence
    pub headers: BTreeMap<String, Vec<String>>,
    /// The Message-ID header value
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub draft: bool,
    pub read: bool,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// `List-Unsubscribe` targets, if the sender offered any
    pub fn unsubscribe_targets(&self) -> Vec<String> {
        self.headers
            .get("list-unsubscribe")
            .into_iter()
            .flatten()
            .flat_map(|value| value.split(','))
            .map(|target| target.trim().trim_matches(|c| c == '<' || c == '>').to_string())
            .filter(|target| !target.is_empty())
            .collect()
    }

    /// Whether any relay reported the message arrived over TLS
    pub fn received_over_tls(&self) -> bool {
        self.headers
            .get("received")
            .into_iter()
            .flatten()
            .any(|hop| {
                let hop = hop.to_ascii_uppercase();
                hop.contains("ESMTPS") || hop.contains("TLS")
            })
    }
}

/// Builder for messages; used by the adapters when normalizing fetch results
#[derive(Default)]
pub struct MessageBuilder {
    id: String,
    thread_id: String,
    from: String,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    subject: String,
    body: Body,
    headers: BTreeMap<String, Vec<String>>,
    message_id: Option<String>,
    in_reply_to: Option<String>,
    references: Vec<String>,
    draft: bool,
    read: bool,
    received_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn to(mut self, to: Vec<Address>) -> Self {
        self.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<Address>) -> Self {
        self.cc = cc;
        self
    }

    pub fn bcc(mut self, bcc: Vec<Address>) -> Self {
        self.bcc = bcc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn in_reply_to(mut self, in_reply_to: impl Into<String>) -> Self {
        self.in_reply_to = Some(in_reply_to.into());
        self
    }

    pub fn references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn draft(mut self, draft: bool) -> Self {
        self.draft = draft;
        self
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: self.id,
            thread_id: self.thread_id,
            from: Address::parse(&self.from),
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            body: self.body,
            headers: self.headers,
            message_id: self.message_id,
            in_reply_to: self.in_reply_to,
            references: self.references,
            draft: self.draft,
            read: self.read,
            received_at: self.received_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Canonical conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub folder: Folder,
    /// User and non-structural system label ids; never contains duplicates
    pub labels: Vec<LabelId>,
    pub unread: bool,
    pub starred: bool,
    pub important: bool,
    /// Message ids, oldest first
    pub message_ids: Vec<MessageId>,
    pub last_activity: DateTime<Utc>,
    pub snippet: String,
    pub subject: String,
    /// Display sender of the newest message
    pub from: String,
    /// Present when the thread was loaded with `get_thread`
    pub messages: Option<Vec<Message>>,
}

impl Thread {
    pub fn new(id: impl Into<String>, folder: Folder) -> Self {
        Self {
            id: id.into(),
            folder,
            labels: Vec::new(),
            unread: false,
            starred: false,
            important: false,
            message_ids: Vec::new(),
            last_activity: Utc::now(),
            snippet: String::new(),
            subject: String::new(),
            from: String::new(),
            messages: None,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Adds a label id unless already present
    pub fn add_label(&mut self, label: &str) {
        if !self.has_label(label) {
            self.labels.push(label.to_string());
        }
    }

    pub fn remove_label(&mut self, label: &str) {
        self.labels.retain(|l| l != label);
    }

    /// Applies a read state to the thread and every loaded message
    pub fn set_read(&mut self, read: bool) {
        self.unread = !read;
        if let Some(messages) = self.messages.as_mut() {
            for message in messages {
                message.read = read;
            }
        }
    }

    /// Re-derives `unread` from the loaded messages, if any
    pub fn sync_unread_from_messages(&mut self) {
        if let Some(messages) = &self.messages {
            self.unread = messages.iter().any(|m| !m.read);
        }
    }

    /// Builds a summary (no message bodies) from a fully loaded thread
    pub fn summary(&self) -> Thread {
        Thread {
            messages: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    pub kind: LabelKind,
    /// Background color as `#rrggbb`
    pub color: Option<String>,
    /// Display category supplied by settings overrides
    #[serde(default)]
    pub category: Option<String>,
}

impl Label {
    pub fn system(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: LabelKind::System,
            color: None,
            category: None,
        }
    }

    pub fn user(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: LabelKind::User,
            color: None,
            category: None,
        }
    }
}

/// Label creation/update request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSpec {
    pub name: String,
    pub color: Option<String>,
}

/// An outgoing message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    /// Defaults to the account identity
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    /// Thread to reply within, if any
    pub thread_id: Option<ThreadId>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl Draft {
    pub fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}

/// One page of a thread listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    pub next_page_token: Option<String>,
}

/// One change reported by a cursor-driven sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadPatch {
    Upsert(Thread),
    Remove(ThreadId),
}

impl ThreadPatch {
    pub fn thread_id(&self) -> &str {
        match self {
            ThreadPatch::Upsert(thread) => &thread.id,
            ThreadPatch::Remove(id) => id,
        }
    }
}

/// Ordered patch stream plus the cursor to resume from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub patches: Vec<ThreadPatch>,
    pub cursor: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_headers(headers: &[(&str, &str)]) -> Message {
        let mut builder = MessageBuilder::new().id("m1").from("a@example.com");
        for (name, value) in headers {
            builder = builder.header(name, *value);
        }
        builder.build()
    }

    #[test]
    fn test_folder_parse_and_move_targets() {
        assert_eq!(Folder::parse("INBOX"), Some(Folder::Inbox));
        assert_eq!(Folder::parse("bin"), Some(Folder::Bin));
        assert_eq!(Folder::parse("nowhere"), None);
        assert!(Folder::Archive.is_move_target());
        assert!(!Folder::Sent.is_move_target());
        assert!(!Folder::Drafts.is_move_target());
    }

    #[test]
    fn test_address_parse_with_name() {
        let addr = Address::parse("\"Doe, John\" <john.doe@company.co.uk>");
        assert_eq!(addr.email, "john.doe@company.co.uk");
        assert_eq!(addr.name.as_deref(), Some("Doe, John"));
        assert_eq!(addr.domain(), "company.co.uk");
    }

    #[test]
    fn test_address_parse_bare() {
        let addr = Address::parse("plain@email.com");
        assert_eq!(addr.email, "plain@email.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.to_string(), "plain@email.com");
    }

    #[test]
    fn test_thread_labels_never_duplicate() {
        let mut thread = Thread::new("t1", Folder::Inbox);
        thread.add_label("Label_1");
        thread.add_label("Label_1");
        assert_eq!(thread.labels, vec!["Label_1"]);
        thread.remove_label("Label_1");
        assert!(thread.labels.is_empty());
    }

    #[test]
    fn test_set_read_updates_messages() {
        let mut thread = Thread::new("t1", Folder::Inbox);
        thread.messages = Some(vec![
            MessageBuilder::new().id("m1").read(false).build(),
            MessageBuilder::new().id("m2").read(true).build(),
        ]);
        thread.sync_unread_from_messages();
        assert!(thread.unread);

        thread.set_read(true);
        assert!(!thread.unread);
        assert!(thread.messages.as_ref().unwrap().iter().all(|m| m.read));
    }

    #[test]
    fn test_unsubscribe_targets() {
        let message = message_with_headers(&[(
            "List-Unsubscribe",
            "<mailto:leave@example.com>, <https://example.com/u?id=1>",
        )]);
        assert_eq!(
            message.unsubscribe_targets(),
            vec!["mailto:leave@example.com", "https://example.com/u?id=1"]
        );
    }

    #[test]
    fn test_received_over_tls() {
        let tls = message_with_headers(&[(
            "Received",
            "from mx.example.com by mx.google.com with ESMTPS id abc",
        )]);
        let plain = message_with_headers(&[("Received", "from relay by mx with SMTP id x")]);
        assert!(tls.received_over_tls());
        assert!(!plain.received_over_tls());
    }

    #[test]
    fn test_structural_labels() {
        assert!(system_labels::is_structural("INBOX"));
        assert!(system_labels::is_structural("STARRED"));
        assert!(!system_labels::is_structural("CATEGORY_SOCIAL"));
        assert!(!system_labels::is_structural("Label_12"));
    }
}
