use chrono::{DateTime, Utc};
use imap::{ImapConnection, Session};
use imap::types::Flag;
use thiserror::Error;
use tracing::debug;

use super::compose::ComposeError;

/// IMAP adapter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImapError {
    #[error("IMAP connection failed: {0}")]
    Connection(String),

    #[error("IMAP login failed: {0}")]
    Auth(String),

    /// Server answered NO or BAD
    #[error("IMAP command rejected: {0}")]
    Command(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("UIDVALIDITY of '{mailbox}' changed")]
    UidValidityChanged { mailbox: String },

    #[error("malformed page token '{0}'")]
    InvalidPageToken(String),

    #[error("no message found for '{0}'")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    /// Permanent SMTP rejection (5xx), e.g. a refused recipient
    #[error("SMTP rejected the message: {0}")]
    SmtpRejected(String),

    #[error("SMTP delivery failed: {0}")]
    SmtpUnavailable(String),
}

impl From<imap::Error> for ImapError {
    fn from(err: imap::Error) -> Self {
        match err {
            imap::Error::No(no) => ImapError::Command(no.information),
            imap::Error::Bad(bad) => ImapError::Command(bad.information),
            imap::Error::Io(e) => ImapError::Connection(e.to_string()),
            imap::Error::ConnectionLost => ImapError::Connection("connection lost".to_string()),
            other => ImapError::Protocol(other.to_string()),
        }
    }
}

/// Status of a selected mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxInfo {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    /// Flags and keywords defined on the mailbox
    pub flags: Vec<String>,
}

/// Flags plus threading/display headers of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedSummary {
    pub uid: u32,
    pub flags: Vec<String>,
    pub header: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
}

/// Flags plus full source of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBody {
    pub uid: u32,
    pub flags: Vec<String>,
    pub raw: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
}

/// Blocking IMAP operations - allows mocking in tests
///
/// Every method operates on the currently selected mailbox except `select`
/// and `append`. UID sets are sent as comma-separated lists.
#[cfg_attr(test, mockall::automock)]
pub trait ImapSession: Send {
    fn select(&mut self, mailbox: &str) -> Result<MailboxInfo, ImapError>;

    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, ImapError>;

    fn fetch_summaries(&mut self, uids: &[u32]) -> Result<Vec<FetchedSummary>, ImapError>;

    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<FetchedBody>, ImapError>;

    /// Issues `UID STORE <uids> <command>`, e.g. `+FLAGS.SILENT (\Seen)`
    fn uid_store(&mut self, uids: &[u32], command: &str) -> Result<(), ImapError>;

    fn uid_move(&mut self, uids: &[u32], mailbox: &str) -> Result<(), ImapError>;

    fn append(&mut self, mailbox: &str, content: &[u8], seen: bool) -> Result<(), ImapError>;

    fn logout(&mut self) -> Result<(), ImapError>;
}

/// Formats a UID list for a command
pub(crate) fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Real IMAP session over TLS
pub struct RealImapSession {
    session: Session<Box<dyn ImapConnection>>,
}

impl RealImapSession {
    /// Connects and logs in
    pub fn connect(host: &str, port: u16, username: &str, password: &str) -> Result<Self, ImapError> {
        debug!("imap: connecting to {}:{}", host, port);
        let client = imap::ClientBuilder::new(host, port)
            .connect()
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        debug!("imap: logging in as {}", username);
        let session = client
            .login(username, password)
            .map_err(|e| ImapError::Auth(e.0.to_string()))?;

        debug!("imap: login successful");
        Ok(Self { session })
    }
}

fn flag_names<F: std::fmt::Display>(flags: impl IntoIterator<Item = F>) -> Vec<String> {
    flags.into_iter().map(|f| f.to_string()).collect()
}

impl ImapSession for RealImapSession {
    fn select(&mut self, mailbox: &str) -> Result<MailboxInfo, ImapError> {
        let selected = self.session.select(mailbox)?;
        Ok(MailboxInfo {
            exists: selected.exists,
            uid_validity: selected.uid_validity,
            uid_next: selected.uid_next,
            flags: flag_names(selected.flags.iter()),
        })
    }

    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, ImapError> {
        let mut uids: Vec<u32> = self.session.uid_search(query)?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_summaries(&mut self, uids: &[u32]) -> Result<Vec<FetchedSummary>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let fetches = self.session.uid_fetch(
            uid_set(uids),
            "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER.FIELDS (FROM TO CC SUBJECT DATE MESSAGE-ID IN-REPLY-TO REFERENCES)])",
        )?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(FetchedSummary {
                    uid: fetch.uid?,
                    flags: flag_names(fetch.flags()),
                    header: fetch.header().unwrap_or_default().to_vec(),
                    internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                })
            })
            .collect())
    }

    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<FetchedBody>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let fetches = self
            .session
            .uid_fetch(uid_set(uids), "(UID FLAGS INTERNALDATE BODY.PEEK[])")?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(FetchedBody {
                    uid: fetch.uid?,
                    flags: flag_names(fetch.flags()),
                    raw: fetch.body()?.to_vec(),
                    internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                })
            })
            .collect())
    }

    fn uid_store(&mut self, uids: &[u32], command: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.session.uid_store(uid_set(uids), command)?;
        Ok(())
    }

    fn uid_move(&mut self, uids: &[u32], mailbox: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.session.uid_mv(uid_set(uids), mailbox)?;
        Ok(())
    }

    fn append(&mut self, mailbox: &str, content: &[u8], seen: bool) -> Result<(), ImapError> {
        let flags = if seen { vec![Flag::Seen] } else { Vec::new() };
        self.session.append(mailbox, content).flags(flags).finish()?;
        Ok(())
    }

    fn logout(&mut self) -> Result<(), ImapError> {
        self.session.logout()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_set() {
        assert_eq!(uid_set(&[3, 9, 12]), "3,9,12");
        assert_eq!(uid_set(&[]), "");
    }

    #[test]
    fn test_error_display() {
        let err = ImapError::UidValidityChanged {
            mailbox: "INBOX".to_string(),
        };
        assert_eq!(err.to_string(), "UIDVALIDITY of 'INBOX' changed");
    }

    #[test]
    fn test_mock_session_search() {
        let mut mock = MockImapSession::new();
        mock.expect_uid_search()
            .with(mockall::predicate::eq("UNSEEN"))
            .returning(|_| Ok(vec![4, 8]));

        assert_eq!(mock.uid_search("UNSEEN").unwrap(), vec![4, 8]);
    }
}
