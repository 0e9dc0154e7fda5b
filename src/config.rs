use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::model::{AccountConnection, CredentialRef, Identity, ProviderKind};

const APP_NAME: &str = "unimail";
const CONFIG_FILE: &str = "config.toml";
const CLIENT_SECRET_FILE: &str = "client_secret.json";
const TOKENS_DIR: &str = "tokens";

/// Top-level configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// User id reported to the session layer; defaults to the active account's email
    pub user_id: Option<String>,
    /// Id of the account connection used by this session
    pub active_account: Option<String>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-label display overrides, keyed by label id
    #[serde(default)]
    pub labels: HashMap<String, LabelOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub provider: ProviderKind,
    pub email: String,
    pub name: Option<String>,
    pub imap: Option<ImapServerConfig>,
    pub smtp: Option<SmtpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapServerConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    /// Defaults to the account email
    pub username: Option<String>,
    /// Plain password, app password, or an `op://` reference
    pub password: String,
    #[serde(default)]
    pub folders: Option<ImapFolderNames>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpServerConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    /// Defaults to the IMAP password
    pub password: Option<String>,
    /// Implicit TLS (port 465) instead of STARTTLS
    #[serde(default)]
    pub implicit_tls: bool,
}

/// Mailbox names backing each canonical folder on an IMAP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapFolderNames {
    pub inbox: String,
    pub archive: String,
    pub spam: String,
    pub bin: String,
    pub sent: String,
    pub drafts: String,
}

impl Default for ImapFolderNames {
    fn default() -> Self {
        Self {
            inbox: "INBOX".to_string(),
            archive: "Archive".to_string(),
            spam: "Junk".to_string(),
            bin: "Trash".to_string(),
            sent: "Sent".to_string(),
            drafts: "Drafts".to_string(),
        }
    }
}

impl ImapFolderNames {
    /// Gmail's IMAP mailbox layout
    pub fn gmail() -> Self {
        Self {
            inbox: "INBOX".to_string(),
            archive: "[Gmail]/All Mail".to_string(),
            spam: "[Gmail]/Spam".to_string(),
            bin: "[Gmail]/Trash".to_string(),
            sent: "[Gmail]/Sent Mail".to_string(),
            drafts: "[Gmail]/Drafts".to_string(),
        }
    }

    /// Explicit names win; otherwise pick the preset matching the host
    pub fn for_host(host: &str, configured: Option<&ImapFolderNames>) -> Self {
        match configured {
            Some(names) => names.clone(),
            None if host.eq_ignore_ascii_case("imap.gmail.com") => Self::gmail(),
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            page_size: default_page_size(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Retry budget shared by the driver (rate limits, timeouts) and the mutation queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            rate_limit_retries: default_rate_limit_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the given zero-based attempt, capped at `max_delay_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    /// Policy with no waiting, for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            rate_limit_retries: max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            call_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOverride {
    pub color: Option<String>,
    pub category: Option<String>,
}

/// Read-only source of per-user label display overrides
pub trait LabelSettings: Send + Sync {
    fn label_override(&self, label_id: &str) -> Option<LabelOverride>;
}

impl LabelSettings for Config {
    fn label_override(&self, label_id: &str) -> Option<LabelOverride> {
        self.labels.get(label_id).cloned()
    }
}

/// Settings source with no overrides
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLabelSettings;

impl LabelSettings for NoLabelSettings {
    fn label_override(&self, _label_id: &str) -> Option<LabelOverride> {
        None
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_poll_interval() -> u64 {
    60
}

fn default_page_size() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// The configured active account, or the only account when there is just one
    pub fn active(&self) -> Option<&AccountConfig> {
        match &self.active_account {
            Some(id) => self.account(id),
            None if self.accounts.len() == 1 => self.accounts.first(),
            None => None,
        }
    }
}

impl AccountConfig {
    pub fn identity(&self) -> Identity {
        Identity {
            email: self.email.clone(),
            name: self.name.clone(),
        }
    }

    /// Builds the account connection record for this account
    pub fn connection(&self) -> Result<AccountConnection> {
        let credentials = match self.provider {
            ProviderKind::Gmail => CredentialRef::OAuthTokenCache(token_cache_path(&self.id)?),
            ProviderKind::Imap => {
                let imap = self
                    .imap
                    .as_ref()
                    .with_context(|| format!("Account '{}' has no [imap] section", self.id))?;
                CredentialRef::Password {
                    username: imap.username.clone().unwrap_or_else(|| self.email.clone()),
                    secret: imap.password.clone(),
                }
            }
        };

        Ok(AccountConnection {
            id: self.id.clone(),
            provider: self.provider,
            credentials,
            identity: self.identity(),
        })
    }
}

/// Returns the configuration directory path
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .context("Failed to determine config directory")
}

/// Returns the path to the config file
pub fn config_path() -> Result<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

/// Returns the path to the Google OAuth client secret
pub fn client_secret_path() -> Result<PathBuf> {
    config_dir().map(|p| p.join(CLIENT_SECRET_FILE))
}

/// Returns the path where an account's OAuth tokens are persisted
pub fn token_cache_path(account_id: &str) -> Result<PathBuf> {
    config_dir().map(|p| p.join(TOKENS_DIR).join(format!("{account_id}.json")))
}

/// Ensures the config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir()?;
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
    }
    Ok(dir)
}

/// Checks if the config file exists
pub fn has_config() -> bool {
    config_path().map(|p| p.exists()).unwrap_or(false)
}

/// Resolves a secret reference (e.g., op://vault/item/field) or returns the value as-is
fn resolve_secret(value: &str) -> Result<String> {
    if value.starts_with("op://") {
        let output = Command::new("op")
            .args(["read", value])
            .output()
            .context("Failed to run 'op' command. Is 1Password CLI installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to read secret from 1Password: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Ok(value.to_string())
    }
}

/// Parses configuration text without resolving secrets
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config.toml")?;

    let mut seen = std::collections::HashSet::new();
    for account in &config.accounts {
        if !seen.insert(account.id.as_str()) {
            anyhow::bail!("Duplicate account id '{}' in config", account.id);
        }
        if account.provider == ProviderKind::Imap && account.imap.is_none() {
            anyhow::bail!("IMAP account '{}' is missing its [imap] section", account.id);
        }
    }
    if let Some(active) = &config.active_account
        && config.account(active).is_none()
    {
        anyhow::bail!("active_account '{}' does not match any account", active);
    }

    Ok(config)
}

/// Loads configuration from a file, resolving secret references
pub fn load_config_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {:?}", path))?;
    let mut config = parse_config(&content)?;

    for account in &mut config.accounts {
        if let Some(imap) = account.imap.as_mut() {
            imap.password = resolve_secret(&imap.password)
                .with_context(|| format!("Failed to resolve IMAP password for '{}'", account.id))?;
        }
        if let Some(smtp) = account.smtp.as_mut()
            && let Some(password) = smtp.password.as_ref()
        {
            smtp.password = Some(
                resolve_secret(password).with_context(|| {
                    format!("Failed to resolve SMTP password for '{}'", account.id)
                })?,
            );
        }
    }

    Ok(config)
}

/// Loads configuration from the default location
pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
active_account = "work"

[[accounts]]
id = "personal"
provider = "gmail"
email = "me@gmail.com"

[[accounts]]
id = "work"
provider = "imap"
email = "me@work.example"
name = "Me At Work"

[accounts.imap]
host = "imap.work.example"
password = "xxxx xxxx xxxx xxxx"

[accounts.smtp]
host = "smtp.work.example"

[sync]
poll_interval_secs = 120

[labels.Label_7]
color = "#ff0000"
category = "projects"
"##;

    #[test]
    fn test_config_dir_not_empty() {
        let path = config_dir().unwrap();
        assert!(path.ends_with(APP_NAME));
    }

    #[test]
    fn test_token_cache_path_is_per_account() {
        let path = token_cache_path("personal").unwrap();
        assert!(path.ends_with("tokens/personal.json"));
    }

    #[test]
    fn test_parse_config() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.active().unwrap().id, "work");

        let imap = config.account("work").unwrap().imap.as_ref().unwrap();
        assert_eq!(imap.port, 993);
        assert_eq!(config.account("work").unwrap().smtp.as_ref().unwrap().port, 587);

        assert_eq!(config.sync.poll_interval_secs, 120);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.label_override("Label_7").unwrap().category.as_deref(),
            Some("projects")
        );
        assert!(config.label_override("Label_8").is_none());
    }

    #[test]
    fn test_parse_config_rejects_unknown_active_account() {
        let err = parse_config("active_account = \"ghost\"").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_parse_config_rejects_imap_without_server() {
        let content = r#"
[[accounts]]
id = "broken"
provider = "imap"
email = "x@example.com"
"#;
        assert!(parse_config(content).is_err());
    }

    #[test]
    fn test_single_account_is_active_by_default() {
        let content = r#"
[[accounts]]
id = "personal"
provider = "gmail"
email = "me@gmail.com"
"#;
        let config = parse_config(content).unwrap();
        assert_eq!(config.active().unwrap().id, "personal");
    }

    #[test]
    fn test_imap_connection_uses_email_as_username() {
        let config = parse_config(SAMPLE).unwrap();
        let conn = config.account("work").unwrap().connection().unwrap();
        assert_eq!(conn.provider, ProviderKind::Imap);
        assert_eq!(
            conn.credentials,
            CredentialRef::Password {
                username: "me@work.example".to_string(),
                secret: "xxxx xxxx xxxx xxxx".to_string(),
            }
        );
        assert_eq!(conn.identity.to_string(), "Me At Work <me@work.example>");
    }

    #[test]
    fn test_folder_names_for_gmail_host() {
        let names = ImapFolderNames::for_host("imap.gmail.com", None);
        assert_eq!(names.archive, "[Gmail]/All Mail");
        let names = ImapFolderNames::for_host("imap.fastmail.com", None);
        assert_eq!(names.spam, "Junk");
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_resolve_secret_returns_value_unchanged_when_not_op_reference() {
        assert_eq!(resolve_secret("my-secret").unwrap(), "my-secret");
        assert_eq!(resolve_secret("").unwrap(), "");
        assert_eq!(
            resolve_secret("op-but-not-reference").unwrap(),
            "op-but-not-reference"
        );
    }
}
