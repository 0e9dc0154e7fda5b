use anyhow::{Context, Result};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use parking_lot::RwLock;
use std::path::Path;
use yup_oauth2::{self as oauth2, authenticator::Authenticator};

use crate::config::{self, Config};
use crate::model::AccountId;

pub type GmailAuthenticator = Authenticator<HttpsConnector<HttpConnector>>;

/// Creates an OAuth2 authenticator for Gmail API access, persisting tokens at `token_path`
pub async fn create_authenticator(token_path: &Path) -> Result<GmailAuthenticator> {
    let secret_path = config::client_secret_path()?;

    if !secret_path.exists() {
        anyhow::bail!(
            "Client secret file not found at {:?}. \
             Please download OAuth2 credentials from Google Cloud Console \
             and save them as client_secret.json in {:?}",
            secret_path,
            config::config_dir()?
        );
    }

    let secret = oauth2::read_application_secret(&secret_path)
        .await
        .context("Failed to read client secret")?;

    if let Some(parent) = token_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create token directory")?;
    }

    let auth = oauth2::InstalledFlowAuthenticator::builder(
        secret,
        oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_path)
    .build()
    .await
    .context("Failed to build authenticator")?;

    Ok(auth)
}

/// Supplies the signed-in user and the session's active account connection
pub trait SessionSource: Send + Sync {
    fn user_id(&self) -> Option<String>;
    fn active_connection(&self) -> Option<AccountId>;
}

/// Session whose active connection is switched explicitly
#[derive(Debug, Default)]
pub struct StaticSession {
    user_id: Option<String>,
    active: RwLock<Option<AccountId>>,
}

impl StaticSession {
    pub fn new(user_id: Option<String>, active: Option<AccountId>) -> Self {
        Self {
            user_id,
            active: RwLock::new(active),
        }
    }

    /// Session for the configured active account
    pub fn from_config(config: &Config) -> Self {
        let active = config.active();
        let user_id = config
            .user_id
            .clone()
            .or_else(|| active.map(|a| a.email.clone()));
        Self::new(user_id, active.map(|a| a.id.clone()))
    }

    pub fn switch_to(&self, account: impl Into<AccountId>) {
        *self.active.write() = Some(account.into());
    }

    pub fn sign_out(&self) {
        *self.active.write() = None;
    }
}

impl SessionSource for StaticSession {
    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn active_connection(&self) -> Option<AccountId> {
        self.active.read().clone()
    }
}
