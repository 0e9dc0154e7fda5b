//! Provider adapters: one variant per backend kind, chosen once per connection.

pub mod compose;
pub mod gmail;
pub mod gmail_api;
pub mod imap;
pub mod imap_session;
pub mod smtp;

use anyhow::{Context, Result};
use std::sync::Arc;
use thiserror::Error;

use crate::auth;
use crate::config::{self, AccountConfig, ImapFolderNames};
use crate::model::{
    ChangeSet, Draft, Folder, Label, LabelId, LabelSpec, MessageId, ProviderKind, Thread, ThreadId,
    ThreadPage,
};
use gmail::GmailAdapter;
use gmail_api::{GmailError, RealGmailApi};
use imap::ImapAdapter;
use imap_session::{ImapError, RealImapSession};
use smtp::LettreSmtp;

/// Error from whichever adapter served the call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Gmail(#[from] GmailError),

    #[error(transparent)]
    Imap(#[from] ImapError),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// The backend of one account connection
pub enum ProviderAdapter {
    Gmail(GmailAdapter),
    Imap(ImapAdapter),
}

/// Forwards a call to the active variant, widening its error
macro_rules! forward {
    ($self:ident, $adapter:ident => $call:expr) => {
        match $self {
            ProviderAdapter::Gmail($adapter) => $call.await.map_err(AdapterError::from),
            ProviderAdapter::Imap($adapter) => $call.await.map_err(AdapterError::from),
        }
    };
}

impl ProviderAdapter {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderAdapter::Gmail(_) => ProviderKind::Gmail,
            ProviderAdapter::Imap(_) => ProviderKind::Imap,
        }
    }

    pub async fn list_threads(
        &self,
        folder: Folder,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> AdapterResult<ThreadPage> {
        forward!(self, a => a.list_threads(folder, query, page_token, page_size))
    }

    pub async fn get_thread(&self, id: &str) -> AdapterResult<Thread> {
        forward!(self, a => a.get_thread(id))
    }

    pub async fn send_message(&self, draft: &Draft) -> AdapterResult<MessageId> {
        forward!(self, a => a.send_message(draft))
    }

    pub async fn modify_labels(
        &self,
        thread_ids: &[ThreadId],
        add: &[LabelId],
        remove: &[LabelId],
    ) -> AdapterResult<()> {
        forward!(self, a => a.modify_labels(thread_ids, add, remove))
    }

    pub async fn move_threads(
        &self,
        thread_ids: &[ThreadId],
        destination: Option<Folder>,
    ) -> AdapterResult<()> {
        forward!(self, a => a.move_threads(thread_ids, destination))
    }

    pub async fn set_read_state(&self, thread_ids: &[ThreadId], read: bool) -> AdapterResult<()> {
        forward!(self, a => a.set_read_state(thread_ids, read))
    }

    pub async fn list_labels(&self) -> AdapterResult<Vec<Label>> {
        forward!(self, a => a.list_labels())
    }

    pub async fn create_label(&self, spec: &LabelSpec) -> AdapterResult<Label> {
        forward!(self, a => a.create_label(spec))
    }

    pub async fn update_label(&self, id: &str, spec: &LabelSpec) -> AdapterResult<Label> {
        forward!(self, a => a.update_label(id, spec))
    }

    pub async fn delete_label(&self, id: &str) -> AdapterResult<()> {
        forward!(self, a => a.delete_label(id))
    }

    /// `None` when the backend has no change feed and must be polled
    pub async fn sync_cursor(&self) -> AdapterResult<Option<String>> {
        forward!(self, a => a.sync_cursor())
    }

    pub async fn changes_since(&self, cursor: &str) -> AdapterResult<ChangeSet> {
        forward!(self, a => a.changes_since(cursor))
    }

    /// Ends the backend session; Gmail holds nothing open
    pub async fn close(&self) -> AdapterResult<()> {
        match self {
            ProviderAdapter::Gmail(_) => Ok(()),
            ProviderAdapter::Imap(adapter) => adapter.logout().await.map_err(AdapterError::from),
        }
    }
}

/// Builds the adapter for a configured account, authenticating as needed
pub async fn connect(account: &AccountConfig) -> Result<ProviderAdapter> {
    match account.provider {
        ProviderKind::Gmail => {
            let token_path = config::token_cache_path(&account.id)?;
            let auth = auth::create_authenticator(&token_path).await?;
            let api = RealGmailApi::new(auth)?;
            Ok(ProviderAdapter::Gmail(GmailAdapter::new(
                Arc::new(api),
                account.identity(),
            )))
        }
        ProviderKind::Imap => {
            let imap = account
                .imap
                .clone()
                .with_context(|| format!("Account '{}' has no [imap] section", account.id))?;
            let smtp = account
                .smtp
                .clone()
                .with_context(|| format!("Account '{}' has no [smtp] section", account.id))?;

            let username = imap.username.clone().unwrap_or_else(|| account.email.clone());
            let folders = ImapFolderNames::for_host(&imap.host, imap.folders.as_ref());

            let transport = LettreSmtp::new(
                &smtp,
                smtp.username.as_deref().unwrap_or(&username),
                smtp.password.as_deref().unwrap_or(&imap.password),
            )?;

            let (host, port, password) = (imap.host.clone(), imap.port, imap.password.clone());
            let session = tokio::task::spawn_blocking(move || {
                RealImapSession::connect(&host, port, &username, &password)
            })
            .await
            .context("IMAP connect task failed")??;

            Ok(ProviderAdapter::Imap(ImapAdapter::new(
                Box::new(session),
                Arc::new(transport),
                folders,
                account.identity(),
            )))
        }
    }
}
