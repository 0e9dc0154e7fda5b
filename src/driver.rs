//! Driver facade: routes every call to the adapter of the session's active
//! connection, bounds it with a timeout, backs off on rate limits and maps
//! adapter errors into [`MailError`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::SessionSource;
use crate::config::{LabelSettings, RetryPolicy};
use crate::error::{MailError, MailResult};
use crate::model::{
    AccountConnection, AccountId, ChangeSet, Draft, Folder, Label, LabelId, LabelKind, LabelSpec,
    MessageId, ProviderKind, Thread, ThreadId, ThreadPage,
};
use crate::provider::gmail_api::GmailError;
use crate::provider::imap_session::ImapError;
use crate::provider::{AdapterError, AdapterResult, ProviderAdapter};

impl From<GmailError> for MailError {
    fn from(err: GmailError) -> Self {
        match err {
            GmailError::Http {
                status,
                reason,
                message,
                retry_after,
            } => {
                let rate_limited = status == 429
                    || matches!(
                        reason.as_deref(),
                        Some("rateLimitExceeded" | "userRateLimitExceeded")
                    );
                match status {
                    _ if rate_limited => MailError::RateLimited { retry_after },
                    401 | 403 => MailError::Unauthenticated(message),
                    400 | 409 => MailError::ValidationError(message),
                    404 => MailError::NotFound(message),
                    _ => MailError::ProviderUnavailable(format!("HTTP {status}: {message}")),
                }
            }
            GmailError::StaleCursor(_) => MailError::InvalidCursor,
            GmailError::Compose(e) => MailError::ValidationError(e.to_string()),
            GmailError::Auth(message) => MailError::Unauthenticated(message),
            GmailError::Transport(message) | GmailError::Malformed(message) => {
                MailError::ProviderUnavailable(message)
            }
        }
    }
}

impl From<ImapError> for MailError {
    fn from(err: ImapError) -> Self {
        match err {
            ImapError::Connection(message)
            | ImapError::Protocol(message)
            | ImapError::SmtpUnavailable(message) => MailError::ProviderUnavailable(message),
            ImapError::Auth(message) => MailError::Unauthenticated(message),
            ImapError::Command(message) => {
                let upper = message.to_ascii_uppercase();
                if upper.contains("UNAVAILABLE") || upper.contains("INUSE") {
                    MailError::ProviderUnavailable(message)
                } else {
                    MailError::ValidationError(message)
                }
            }
            ImapError::UidValidityChanged { .. } | ImapError::InvalidPageToken(_) => {
                MailError::InvalidCursor
            }
            ImapError::NotFound(id) => MailError::NotFound(id),
            ImapError::InvalidRequest(message) | ImapError::SmtpRejected(message) => {
                MailError::ValidationError(message)
            }
            ImapError::Compose(e) => MailError::ValidationError(e.to_string()),
        }
    }
}

impl From<AdapterError> for MailError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Gmail(e) => e.into(),
            AdapterError::Imap(e) => e.into(),
        }
    }
}

/// A registered connection and the adapter built for it
pub struct Connected {
    pub connection: AccountConnection,
    pub adapter: ProviderAdapter,
}

/// Single entry point for mail operations on the active account
pub struct MailDriver {
    session: Arc<dyn SessionSource>,
    settings: Arc<dyn LabelSettings>,
    retry: RetryPolicy,
    connections: RwLock<HashMap<AccountId, Arc<Connected>>>,
}

impl MailDriver {
    pub fn new(
        session: Arc<dyn SessionSource>,
        settings: Arc<dyn LabelSettings>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            session,
            settings,
            retry,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Registers an account connection with the adapter built for it
    pub fn connect(&self, connection: AccountConnection, adapter: ProviderAdapter) -> MailResult<()> {
        if connection.provider != adapter.kind() {
            return Err(MailError::ValidationError(format!(
                "account '{}' is {:?} but the adapter is {:?}",
                connection.id,
                connection.provider,
                adapter.kind()
            )));
        }

        info!(
            "driver: connected account {} ({:?})",
            connection.id, connection.provider
        );
        let id = connection.id.clone();
        self.connections
            .write()
            .insert(id, Arc::new(Connected { connection, adapter }));
        Ok(())
    }

    /// Drops a connection and closes its adapter; returns whether it was registered
    pub async fn disconnect(&self, id: &str) -> bool {
        let Some(connected) = self.connections.write().remove(id) else {
            return false;
        };
        info!("driver: disconnected account {}", id);
        if let Err(e) = connected.adapter.close().await {
            warn!("driver: closing account {} failed: {}", id, MailError::from(e));
        }
        true
    }

    fn lookup(&self, id: &str) -> MailResult<Arc<Connected>> {
        self.connections
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MailError::Unauthenticated(format!("account '{id}' is not connected")))
    }

    fn active(&self) -> MailResult<Arc<Connected>> {
        let id = self
            .session
            .active_connection()
            .ok_or_else(|| MailError::Unauthenticated("no active account connection".to_string()))?;
        self.lookup(&id)
    }

    pub fn active_account(&self) -> MailResult<AccountId> {
        Ok(self.active()?.connection.id.clone())
    }

    pub fn active_provider(&self) -> MailResult<ProviderKind> {
        Ok(self.active()?.adapter.kind())
    }

    /// Calls on one registered account, whichever account is active
    pub fn for_account(&self, id: &str) -> MailResult<AccountCalls<'_>> {
        Ok(AccountCalls {
            driver: self,
            connected: self.lookup(id)?,
        })
    }

    fn current(&self) -> MailResult<AccountCalls<'_>> {
        Ok(AccountCalls {
            driver: self,
            connected: self.active()?,
        })
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> MailResult<T>
    where
        F: Fn(Arc<Connected>) -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let connected = self.active()?;
        self.call_on(&connected, op, f).await
    }

    /// Runs one adapter call with the per-call timeout, retrying rate limits
    async fn call_on<T, F, Fut>(&self, connected: &Arc<Connected>, op: &'static str, f: F) -> MailResult<T>
    where
        F: Fn(Arc<Connected>) -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let timeout = self.retry.call_timeout();
        let mut attempt = 0;

        loop {
            let result = match tokio::time::timeout(timeout, f(Arc::clone(connected))).await {
                Ok(result) => result.map_err(MailError::from),
                Err(_) => Err(MailError::ProviderUnavailable(format!(
                    "{op} timed out after {}s",
                    timeout.as_secs()
                ))),
            };

            match result {
                Err(MailError::RateLimited { retry_after })
                    if attempt < self.retry.rate_limit_retries =>
                {
                    let delay = retry_after.unwrap_or_else(|| self.retry.backoff(attempt));
                    warn!(
                        "driver: {} rate limited, retrying in {:?} (attempt {}/{})",
                        op,
                        delay,
                        attempt + 1,
                        self.retry.rate_limit_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("driver: {} failed: {}", op, e);
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    pub async fn list_threads(
        &self,
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> MailResult<ThreadPage> {
        self.call("list_threads", |c| async move {
            c.adapter
                .list_threads(folder, query, page_token, page_size)
                .await
        })
        .await
    }

    pub async fn get_thread(&self, id: &str) -> MailResult<Thread> {
        self.current()?.get_thread(id).await
    }

    pub async fn send_message(&self, draft: &Draft) -> MailResult<MessageId> {
        self.call("send_message", |c| async move { c.adapter.send_message(draft).await })
            .await
    }

    pub async fn modify_labels(
        &self,
        thread_ids: &[ThreadId],
        add: &[LabelId],
        remove: &[LabelId],
    ) -> MailResult<()> {
        self.current()?.modify_labels(thread_ids, add, remove).await
    }

    pub async fn move_threads(
        &self,
        thread_ids: &[ThreadId],
        destination: Option<Folder>,
    ) -> MailResult<()> {
        self.current()?.move_threads(thread_ids, destination).await
    }

    pub async fn set_read_state(&self, thread_ids: &[ThreadId], read: bool) -> MailResult<()> {
        self.current()?.set_read_state(thread_ids, read).await
    }

    /// Applies the settings collaborator's display overrides
    fn decorate(&self, mut label: Label) -> Label {
        if let Some(overrides) = self.settings.label_override(&label.id) {
            if overrides.color.is_some() {
                label.color = overrides.color;
            }
            label.category = overrides.category;
        }
        label
    }

    /// Every label, system and user, with display overrides applied
    pub async fn list_labels(&self) -> MailResult<Vec<Label>> {
        let labels = self
            .call("list_labels", |c| async move { c.adapter.list_labels().await })
            .await?;
        Ok(labels.into_iter().map(|l| self.decorate(l)).collect())
    }

    /// User-defined labels with display overrides applied
    pub async fn get_user_labels(&self) -> MailResult<Vec<Label>> {
        Ok(self
            .list_labels()
            .await?
            .into_iter()
            .filter(|l| l.kind == LabelKind::User)
            .collect())
    }

    pub async fn create_label(&self, spec: &LabelSpec) -> MailResult<Label> {
        validate_label_spec(spec)?;
        let label = self
            .call("create_label", |c| async move { c.adapter.create_label(spec).await })
            .await?;
        Ok(self.decorate(label))
    }

    pub async fn update_label(&self, id: &str, spec: &LabelSpec) -> MailResult<Label> {
        validate_label_spec(spec)?;
        let label = self
            .call("update_label", |c| async move {
                c.adapter.update_label(id, spec).await
            })
            .await?;
        Ok(self.decorate(label))
    }

    pub async fn delete_label(&self, id: &str) -> MailResult<()> {
        self.call("delete_label", |c| async move { c.adapter.delete_label(id).await })
            .await
    }

    pub async fn sync_cursor(&self) -> MailResult<Option<String>> {
        self.call("sync_cursor", |c| async move { c.adapter.sync_cursor().await })
            .await
    }

    pub async fn changes_since(&self, cursor: &str) -> MailResult<ChangeSet> {
        self.call("changes_since", |c| async move {
            c.adapter.changes_since(cursor).await
        })
        .await
    }
}

/// Thread reads and writes bound to one connection.
///
/// Background work started for an account keeps using that account's
/// adapter even after the session switches to another one.
pub struct AccountCalls<'a> {
    driver: &'a MailDriver,
    connected: Arc<Connected>,
}

impl AccountCalls<'_> {
    pub fn account(&self) -> &str {
        &self.connected.connection.id
    }

    pub async fn get_thread(&self, id: &str) -> MailResult<Thread> {
        self.driver
            .call_on(&self.connected, "get_thread", |c| async move {
                c.adapter.get_thread(id).await
            })
            .await
    }

    pub async fn modify_labels(
        &self,
        thread_ids: &[ThreadId],
        add: &[LabelId],
        remove: &[LabelId],
    ) -> MailResult<()> {
        if thread_ids.is_empty() {
            return Ok(());
        }
        if let Some(label) = add.iter().find(|l| remove.contains(l)) {
            return Err(MailError::ValidationError(format!(
                "label '{label}' is both added and removed"
            )));
        }

        self.driver
            .call_on(&self.connected, "modify_labels", |c| async move {
                c.adapter.modify_labels(thread_ids, add, remove).await
            })
            .await
    }

    pub async fn move_threads(
        &self,
        thread_ids: &[ThreadId],
        destination: Option<Folder>,
    ) -> MailResult<()> {
        if let Some(folder) = destination
            && !folder.is_move_target()
        {
            return Err(MailError::ValidationError(format!(
                "cannot move threads to {folder}"
            )));
        }
        if thread_ids.is_empty() {
            return Ok(());
        }

        self.driver
            .call_on(&self.connected, "move_threads", |c| async move {
                c.adapter.move_threads(thread_ids, destination).await
            })
            .await
    }

    pub async fn set_read_state(&self, thread_ids: &[ThreadId], read: bool) -> MailResult<()> {
        if thread_ids.is_empty() {
            return Ok(());
        }

        self.driver
            .call_on(&self.connected, "set_read_state", |c| async move {
                c.adapter.set_read_state(thread_ids, read).await
            })
            .await
    }
}

fn validate_label_spec(spec: &LabelSpec) -> MailResult<()> {
    if spec.name.trim().is_empty() {
        return Err(MailError::ValidationError("label name is empty".to_string()));
    }
    if let Some(color) = &spec.color {
        let hex = color.strip_prefix('#').unwrap_or_default();
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MailError::ValidationError(format!(
                "label color '{color}' is not #rrggbb"
            )));
        }
    }
    Ok(())
}
