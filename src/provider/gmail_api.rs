use anyhow::Context;
use async_trait::async_trait;
use google_gmail1::Gmail;
use google_gmail1::api::{Label as ApiLabel, LabelColor, Message, ModifyThreadRequest};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use std::collections::HashSet;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::auth::GmailAuthenticator;
use crate::provider::compose::ComposeError;

/// Errors raised by the Gmail REST layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GmailError {
    #[error("Gmail request failed with HTTP {status}: {message}")]
    Http {
        status: u16,
        /// Error reason from the JSON body (`rateLimitExceeded`, `notFound`, ...)
        reason: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// History id older than Gmail retains, or a page token it no longer accepts
    #[error("Gmail sync cursor '{0}' is no longer valid")]
    StaleCursor(String),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("Gmail transport error: {0}")]
    Transport(String),

    #[error("Gmail authorization failed: {0}")]
    Auth(String),

    #[error("Gmail returned an unusable response: {0}")]
    Malformed(String),
}

impl GmailError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GmailError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<google_gmail1::Error> for GmailError {
    fn from(err: google_gmail1::Error) -> Self {
        use google_gmail1::Error as ApiError;

        match err {
            ApiError::BadRequest(body) => {
                let error: &serde_json::Value = &body["error"];
                GmailError::Http {
                    status: error["code"].as_u64().unwrap_or(400) as u16,
                    reason: error["errors"][0]["reason"]
                        .as_str()
                        .or_else(|| error["status"].as_str())
                        .map(str::to_string),
                    message: error["message"]
                        .as_str()
                        .unwrap_or("bad request")
                        .to_string(),
                    retry_after: None,
                }
            }
            ApiError::Failure(response) => {
                let retry_after = response
                    .headers()
                    .get(hyper::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let status = response.status();
                GmailError::Http {
                    status: status.as_u16(),
                    reason: None,
                    message: status.canonical_reason().unwrap_or("request failed").to_string(),
                    retry_after,
                }
            }
            ApiError::MissingToken(e) => GmailError::Auth(e.to_string()),
            ApiError::JsonDecodeError(_, e) => GmailError::Malformed(e.to_string()),
            ApiError::HttpError(e) => GmailError::Transport(e.to_string()),
            ApiError::Io(e) => GmailError::Transport(e.to_string()),
            other => GmailError::Transport(other.to_string()),
        }
    }
}

/// Parameters of a `users.threads.list` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadListRequest {
    pub label_ids: Vec<String>,
    pub query: Option<String>,
    pub page_token: Option<String>,
    pub max_results: u32,
    pub include_spam_trash: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawThreadList {
    pub thread_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
    pub snippet: String,
    /// Milliseconds since the epoch
    pub internal_date: Option<i64>,
    /// Metadata headers (From, To, Subject, Date)
    pub headers: Vec<(String, String)>,
    /// Full RFC 5322 source when requested
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawThread {
    pub id: String,
    pub history_id: Option<u64>,
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHistoryPage {
    /// Threads touched by any history record, first occurrence order
    pub thread_ids: Vec<String>,
    pub history_id: Option<u64>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLabel {
    pub id: Option<String>,
    pub name: String,
    /// `system` or `user`
    pub kind: Option<String>,
    pub color: Option<String>,
}

/// Gmail REST operations - allows mocking in tests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GmailApi: Send + Sync {
    async fn list_threads(&self, request: ThreadListRequest) -> Result<RawThreadList, GmailError>;

    /// Fetches a thread with metadata headers, plus raw sources when `with_bodies`
    async fn get_thread(&self, id: String, with_bodies: bool) -> Result<RawThread, GmailError>;

    async fn modify_thread(
        &self,
        id: String,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<(), GmailError>;

    /// Sends an RFC 5322 message, returning the new message id
    async fn send_raw(&self, raw: Vec<u8>, thread_id: Option<String>) -> Result<String, GmailError>;

    async fn history_since(
        &self,
        start: u64,
        page_token: Option<String>,
    ) -> Result<RawHistoryPage, GmailError>;

    async fn current_history_id(&self) -> Result<u64, GmailError>;

    async fn list_labels(&self) -> Result<Vec<RawLabel>, GmailError>;

    async fn create_label(&self, label: RawLabel) -> Result<RawLabel, GmailError>;

    async fn patch_label(&self, id: String, label: RawLabel) -> Result<RawLabel, GmailError>;

    async fn delete_label(&self, id: String) -> Result<(), GmailError>;
}

/// Real Gmail API client
pub struct RealGmailApi {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl RealGmailApi {
    /// Creates a new Gmail client with the given authenticator
    pub fn new(auth: GmailAuthenticator) -> anyhow::Result<Self> {
        let client = google_gmail1::hyper_util::client::legacy::Client::builder(
            google_gmail1::hyper_util::rt::TokioExecutor::new(),
        )
        .build(
            google_gmail1::hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .context("Failed to load native TLS roots")?
                .https_or_http()
                .enable_http1()
                .build(),
        );

        let hub = Gmail::new(client, auth);
        Ok(Self { hub })
    }

    fn raw_message(msg: Message) -> Option<RawMessage> {
        let id = msg.id?;
        let headers = msg
            .payload
            .and_then(|p| p.headers)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|h| Some((h.name?, h.value?)))
            .collect();

        Some(RawMessage {
            id,
            thread_id: msg.thread_id.unwrap_or_default(),
            label_ids: msg.label_ids.unwrap_or_default(),
            snippet: msg.snippet.unwrap_or_default(),
            internal_date: msg.internal_date,
            headers,
            raw: msg.raw,
        })
    }

    fn raw_label(label: ApiLabel) -> RawLabel {
        RawLabel {
            id: label.id,
            name: label.name.unwrap_or_default(),
            kind: label.type_,
            color: label.color.and_then(|c| c.background_color),
        }
    }

    fn api_label(label: RawLabel) -> ApiLabel {
        ApiLabel {
            name: Some(label.name),
            color: label.color.map(|background| LabelColor {
                background_color: Some(background),
                text_color: Some("#000000".to_string()),
            }),
            label_list_visibility: Some("labelShow".to_string()),
            message_list_visibility: Some("show".to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl GmailApi for RealGmailApi {
    async fn list_threads(&self, request: ThreadListRequest) -> Result<RawThreadList, GmailError> {
        let mut call = self
            .hub
            .users()
            .threads_list("me")
            .max_results(request.max_results)
            .include_spam_trash(request.include_spam_trash);

        for label in &request.label_ids {
            call = call.add_label_ids(label);
        }
        if let Some(query) = &request.query {
            call = call.q(query);
        }
        if let Some(token) = &request.page_token {
            call = call.page_token(token);
        }

        let (_, response) = call.doit().await.map_err(|e| match GmailError::from(e) {
            GmailError::Http {
                status: 400,
                message,
                ..
            } if message.to_ascii_lowercase().contains("page token")
                || message.contains("pageToken") =>
            {
                GmailError::StaleCursor(request.page_token.clone().unwrap_or_default())
            }
            other => other,
        })?;

        Ok(RawThreadList {
            thread_ids: response
                .threads
                .unwrap_or_default()
                .into_iter()
                .filter_map(|t| t.id)
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn get_thread(&self, id: String, with_bodies: bool) -> Result<RawThread, GmailError> {
        let (_, thread) = self
            .hub
            .users()
            .threads_get("me", &id)
            .format("metadata")
            .add_metadata_headers("From")
            .add_metadata_headers("To")
            .add_metadata_headers("Subject")
            .add_metadata_headers("Date")
            .doit()
            .await?;

        let mut messages: Vec<RawMessage> = thread
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(Self::raw_message)
            .collect();

        if with_bodies {
            for message in &mut messages {
                debug!("gmail: fetching raw source of {}", message.id);
                let (_, full) = self
                    .hub
                    .users()
                    .messages_get("me", &message.id)
                    .format("raw")
                    .doit()
                    .await?;
                message.raw = full.raw;
            }
        }

        Ok(RawThread {
            id: thread.id.unwrap_or(id),
            history_id: thread.history_id,
            messages,
        })
    }

    async fn modify_thread(
        &self,
        id: String,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<(), GmailError> {
        let request = ModifyThreadRequest {
            add_label_ids: (!add.is_empty()).then_some(add),
            remove_label_ids: (!remove.is_empty()).then_some(remove),
        };

        self.hub
            .users()
            .threads_modify(request, "me", &id)
            .doit()
            .await?;

        Ok(())
    }

    async fn send_raw(&self, raw: Vec<u8>, thread_id: Option<String>) -> Result<String, GmailError> {
        let message = Message {
            thread_id,
            ..Default::default()
        };
        let mime_type: mime::Mime = "message/rfc822"
            .parse()
            .map_err(|e: mime::FromStrError| GmailError::Malformed(e.to_string()))?;

        let (_, sent) = self
            .hub
            .users()
            .messages_send(message, "me")
            .upload(Cursor::new(raw), mime_type)
            .await?;

        sent.id
            .ok_or_else(|| GmailError::Malformed("sent message has no id".to_string()))
    }

    async fn history_since(
        &self,
        start: u64,
        page_token: Option<String>,
    ) -> Result<RawHistoryPage, GmailError> {
        let mut call = self.hub.users().history_list("me").start_history_id(start);
        if let Some(token) = &page_token {
            call = call.page_token(token);
        }

        let (_, response) = call.doit().await.map_err(|e| match GmailError::from(e) {
            GmailError::Http { status: 404, .. } => GmailError::StaleCursor(start.to_string()),
            other => other,
        })?;

        let mut seen = HashSet::new();
        let mut thread_ids = Vec::new();
        for record in response.history.unwrap_or_default() {
            let touched = record
                .messages
                .unwrap_or_default()
                .into_iter()
                .chain(
                    record
                        .messages_added
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|m| m.message),
                )
                .chain(
                    record
                        .messages_deleted
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|m| m.message),
                )
                .chain(
                    record
                        .labels_added
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|m| m.message),
                )
                .chain(
                    record
                        .labels_removed
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|m| m.message),
                );

            for message in touched {
                if let Some(thread_id) = message.thread_id
                    && seen.insert(thread_id.clone())
                {
                    thread_ids.push(thread_id);
                }
            }
        }

        Ok(RawHistoryPage {
            thread_ids,
            history_id: response.history_id,
            next_page_token: response.next_page_token,
        })
    }

    async fn current_history_id(&self) -> Result<u64, GmailError> {
        let (_, profile) = self.hub.users().get_profile("me").doit().await?;
        profile
            .history_id
            .ok_or_else(|| GmailError::Malformed("profile has no history id".to_string()))
    }

    async fn list_labels(&self) -> Result<Vec<RawLabel>, GmailError> {
        let (_, response) = self.hub.users().labels_list("me").doit().await?;
        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(Self::raw_label)
            .collect())
    }

    async fn create_label(&self, label: RawLabel) -> Result<RawLabel, GmailError> {
        let (_, created) = self
            .hub
            .users()
            .labels_create(Self::api_label(label), "me")
            .doit()
            .await?;
        Ok(Self::raw_label(created))
    }

    async fn patch_label(&self, id: String, label: RawLabel) -> Result<RawLabel, GmailError> {
        let (_, patched) = self
            .hub
            .users()
            .labels_patch(Self::api_label(label), "me", &id)
            .doit()
            .await?;
        Ok(Self::raw_label(patched))
    }

    async fn delete_label(&self, id: String) -> Result<(), GmailError> {
        self.hub.users().labels_delete("me", &id).doit().await?;
        Ok(())
    }
}
