use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::imap_session::ImapError;
use crate::config::SmtpServerConfig;

/// SMTP submission - allows mocking in tests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmtpTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), ImapError>;
}

/// Submission through lettre's async transport
pub struct LettreSmtp {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl LettreSmtp {
    pub fn new(config: &SmtpServerConfig, username: &str, password: &str) -> Result<Self, ImapError> {
        let credentials = Credentials::new(username.to_string(), password.to_string());

        let builder = if config.implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| ImapError::SmtpUnavailable(format!("SMTP relay error: {e}")))?;

        let transport = builder.port(config.port).credentials(credentials).build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl SmtpTransport for LettreSmtp {
    async fn send(&self, message: Message) -> Result<(), ImapError> {
        let recipients = message.envelope().to().len();
        debug!("smtp: submitting message for {} recipient(s)", recipients);

        match self.transport.send(message).await {
            Ok(_) => Ok(()),
            // A refused recipient fails the whole submission rather than being skipped
            Err(e) if e.is_permanent() => Err(ImapError::SmtpRejected(e.to_string())),
            Err(e) => Err(ImapError::SmtpUnavailable(e.to_string())),
        }
    }
}
