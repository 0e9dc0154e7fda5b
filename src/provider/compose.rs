//! Builds outgoing RFC 5322 messages from drafts.

use lettre::Message as OutgoingMessage;
use lettre::message::{Mailbox, MultiPart, SinglePart, header::ContentType};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Draft, Identity};
use crate::parse::extract_domain;
use crate::threading::normalize_id;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("message has no recipients")]
    NoRecipients,

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),
}

/// A built message ready for submission
#[derive(Debug, Clone)]
pub struct Composed {
    pub message: OutgoingMessage,
    /// Message-ID header value, angle brackets included
    pub message_id: String,
    /// Number of envelope recipients
    pub recipient_count: usize,
}

impl Composed {
    /// Full RFC 5322 source
    pub fn raw(&self) -> Vec<u8> {
        self.message.formatted()
    }
}

fn mailbox(raw: &str) -> Result<Mailbox, ComposeError> {
    raw.trim()
        .parse::<Mailbox>()
        .map_err(|_| ComposeError::InvalidAddress(raw.to_string()))
}

/// Builds the outgoing message for `draft`, sent as `identity` unless the draft overrides it.
///
/// Every recipient is validated up front; one bad address rejects the whole draft
/// rather than being dropped. `keep_bcc` keeps the Bcc header in the source, which
/// providers that derive the envelope from headers need; SMTP submission must not.
pub fn compose(draft: &Draft, identity: &Identity, keep_bcc: bool) -> Result<Composed, ComposeError> {
    if draft.recipients().all(|r| r.trim().is_empty()) {
        return Err(ComposeError::NoRecipients);
    }

    let from = match &draft.from {
        Some(from) => mailbox(from)?,
        None => mailbox(&identity.to_string())?,
    };
    let message_id = format!(
        "<{}@{}>",
        Uuid::new_v4(),
        extract_domain(&from.email.to_string())
    );

    let mut builder = OutgoingMessage::builder()
        .from(from)
        .subject(draft.subject.clone())
        .message_id(Some(message_id.clone()));
    if keep_bcc {
        builder = builder.keep_bcc();
    }

    let mut recipient_count = 0;
    for to in draft.to.iter().filter(|r| !r.trim().is_empty()) {
        builder = builder.to(mailbox(to)?);
        recipient_count += 1;
    }
    for cc in draft.cc.iter().filter(|r| !r.trim().is_empty()) {
        builder = builder.cc(mailbox(cc)?);
        recipient_count += 1;
    }
    for bcc in draft.bcc.iter().filter(|r| !r.trim().is_empty()) {
        builder = builder.bcc(mailbox(bcc)?);
        recipient_count += 1;
    }

    if let Some(in_reply_to) = &draft.in_reply_to {
        builder = builder.in_reply_to(format!("<{}>", normalize_id(in_reply_to)));
    }
    if !draft.references.is_empty() {
        let references = draft
            .references
            .iter()
            .map(|r| format!("<{}>", normalize_id(r)))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.references(references);
    }

    let message = match &draft.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            draft.text.clone(),
            html.clone(),
        )),
        None => builder.singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(draft.text.clone()),
        ),
    }
    .map_err(|e| ComposeError::Build(e.to_string()))?;

    Ok(Composed {
        message,
        message_id,
        recipient_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            email: "me@example.com".to_string(),
            name: Some("Me".to_string()),
        }
    }

    fn draft(to: &[&str]) -> Draft {
        Draft {
            to: to.iter().map(|s| s.to_string()).collect(),
            subject: "Hello".to_string(),
            text: "Hi there".to_string(),
            ..Draft::default()
        }
    }

    #[test]
    fn test_compose_rejects_empty_recipients() {
        let err = compose(&draft(&[]), &identity(), true).unwrap_err();
        assert_eq!(err, ComposeError::NoRecipients);

        let err = compose(&draft(&["  "]), &identity(), true).unwrap_err();
        assert_eq!(err, ComposeError::NoRecipients);
    }

    #[test]
    fn test_compose_rejects_bad_address_instead_of_dropping_it() {
        let err = compose(&draft(&["ok@example.com", "not an address"]), &identity(), true).unwrap_err();
        assert_eq!(err, ComposeError::InvalidAddress("not an address".to_string()));
    }

    #[test]
    fn test_compose_counts_every_recipient() {
        let mut d = draft(&["a@example.com", "b@example.com"]);
        d.cc = vec!["c@example.com".to_string()];
        d.bcc = vec!["hidden@example.com".to_string()];

        let composed = compose(&d, &identity(), true).unwrap();
        assert_eq!(composed.recipient_count, 4);
        assert!(composed.message_id.ends_with("@example.com>"));

        let raw = String::from_utf8(composed.raw()).unwrap();
        assert!(raw.contains("hidden@example.com"));
        assert!(raw.contains("Subject: Hello"));
    }

    #[test]
    fn test_compose_for_smtp_hides_bcc_but_keeps_envelope() {
        let mut d = draft(&["a@example.com"]);
        d.bcc = vec!["hidden@example.com".to_string()];

        let composed = compose(&d, &identity(), false).unwrap();
        let raw = String::from_utf8(composed.raw()).unwrap();
        assert!(!raw.contains("hidden@example.com"));
        assert_eq!(composed.message.envelope().to().len(), 2);
    }

    #[test]
    fn test_compose_reply_headers() {
        let mut d = draft(&["a@example.com"]);
        d.in_reply_to = Some("parent@example.com".to_string());
        d.references = vec!["<root@example.com>".to_string(), "parent@example.com".to_string()];

        let raw = String::from_utf8(compose(&d, &identity(), true).unwrap().raw()).unwrap();
        assert!(raw.contains("In-Reply-To: <parent@example.com>"));
        assert!(raw.contains("References: <root@example.com> <parent@example.com>"));
    }
}
