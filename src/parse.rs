//! RFC 5322 parsing shared by both provider adapters

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use regex::Regex;
use std::sync::LazyLock;

use crate::model::{Address, Body, Message, MessageBuilder};

static ANGLE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("static regex"));

/// Headers retained on canonical messages
const EVIDENCE_HEADERS: [&str; 4] = [
    "List-Unsubscribe",
    "List-Unsubscribe-Post",
    "Received",
    "Authentication-Results",
];

/// Bare address from `Name <user@host>`; input without brackets is returned trimmed
pub fn extract_email(from: &str) -> String {
    if let Some(captures) = ANGLE_ADDR.captures(from) {
        captures
            .get(1)
            .map_or_else(String::new, |m| m.as_str().trim().to_string())
    } else {
        from.trim().to_string()
    }
}

/// Part after the `@`, or the whole input when there is none
pub fn extract_domain(email: &str) -> String {
    email.split('@').nth(1).unwrap_or(email).to_string()
}

/// Date header value in any of the shapes seen in the wild
pub fn parse_email_date(date_str: &str) -> Option<DateTime<Utc>> {
    let date_str = date_str.trim();

    // RFC 2822 covers nearly everything real servers send
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%a, %d %b %Y %H:%M:%S %Z",
    ];

    for fmt in &formats {
        if let Ok(dt) = DateTime::parse_from_str(date_str, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // Trailing comments like "(UTC)" trip chrono but not mailparse
    if let Ok(ts) = mailparse::dateparse(date_str) {
        return Utc.timestamp_opt(ts, 0).single();
    }

    if let Ok(ts) = date_str.parse::<i64>() {
        return Utc.timestamp_opt(ts, 0).single();
    }

    None
}

/// Parses a whitespace-separated list of Message-IDs (References header)
pub fn parse_message_id_list(s: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut current = String::new();
    let mut in_angle = false;

    for c in s.chars() {
        match c {
            '<' => {
                in_angle = true;
                current.push(c);
            }
            '>' => {
                current.push(c);
                in_angle = false;
                ids.push(current.trim().to_string());
                current = String::new();
            }
            ' ' | '\t' | '\r' | '\n' | ',' if !in_angle => {}
            _ => current.push(c),
        }
    }

    if !current.trim().is_empty() {
        ids.push(current.trim().to_string());
    }

    ids
}

/// Parses an address-list header value, keeping group members
pub fn parse_address_list(value: &str) -> Vec<Address> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![Address {
                    name: info.display_name.clone(),
                    email: info.addr.clone(),
                }],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| Address {
                        name: info.display_name.clone(),
                        email: info.addr.clone(),
                    })
                    .collect(),
            })
            .collect(),
        Err(_) => value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Address::parse)
            .collect(),
    }
}

/// The header fields the canonical model cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub from: String,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub evidence: Vec<(String, String)>,
}

impl HeaderFields {
    pub fn from_headers(headers: &[MailHeader<'_>]) -> Self {
        let list = |name: &str| {
            headers
                .get_all_values(name)
                .iter()
                .flat_map(|v| parse_address_list(v))
                .collect::<Vec<_>>()
        };

        let evidence = EVIDENCE_HEADERS
            .iter()
            .flat_map(|name| {
                headers
                    .get_all_values(name)
                    .into_iter()
                    .map(move |value| (name.to_string(), value))
            })
            .collect();

        Self {
            from: headers.get_first_value("From").unwrap_or_default(),
            to: list("To"),
            cc: list("Cc"),
            bcc: list("Bcc"),
            subject: headers.get_first_value("Subject").unwrap_or_default(),
            date: headers
                .get_first_value("Date")
                .and_then(|d| parse_email_date(&d)),
            message_id: headers
                .get_first_value("Message-ID")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            in_reply_to: headers
                .get_first_value("In-Reply-To")
                .and_then(|v| parse_message_id_list(&v).into_iter().next()),
            references: headers
                .get_first_value("References")
                .map(|v| parse_message_id_list(&v))
                .unwrap_or_default(),
            evidence,
        }
    }

    /// Parses a raw header block (as returned by `BODY.PEEK[HEADER]`)
    pub fn parse_block(raw: &[u8]) -> Self {
        match mailparse::parse_headers(raw) {
            Ok((headers, _)) => Self::from_headers(&headers),
            Err(_) => Self::default(),
        }
    }

    /// Starts a message builder populated with these fields
    pub fn into_builder(self) -> MessageBuilder {
        let mut builder = MessageBuilder::new()
            .from(self.from)
            .to(self.to)
            .cc(self.cc)
            .bcc(self.bcc)
            .subject(self.subject)
            .references(self.references);
        if let Some(date) = self.date {
            builder = builder.received_at(date);
        }
        if let Some(message_id) = self.message_id {
            builder = builder.message_id(message_id);
        }
        if let Some(in_reply_to) = self.in_reply_to {
            builder = builder.in_reply_to(in_reply_to);
        }
        for (name, value) in self.evidence {
            builder = builder.header(&name, value);
        }
        builder
    }
}

/// Decodes text and HTML bodies from a parsed MIME tree, skipping attachments
fn collect_bodies(part: &ParsedMail<'_>, body: &mut Body) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, body);
        }
        return;
    }

    if matches!(
        part.get_content_disposition().disposition,
        mailparse::DispositionType::Attachment
    ) {
        return;
    }

    match part.ctype.mimetype.to_ascii_lowercase().as_str() {
        "text/plain" if body.text.is_none() => body.text = part.get_body().ok(),
        "text/html" if body.html.is_none() => body.html = part.get_body().ok(),
        _ => {}
    }
}

/// Parses a full RFC 5322 message into a canonical message.
/// Returns `None` if the bytes are not a parseable message.
pub fn parse_rfc822(raw: &[u8], id: &str, thread_id: &str) -> Option<Message> {
    let parsed = mailparse::parse_mail(raw).ok()?;
    let fields = HeaderFields::from_headers(&parsed.headers);

    let mut body = Body {
        raw: Some(raw.to_vec()),
        ..Body::default()
    };
    collect_bodies(&parsed, &mut body);

    Some(
        fields
            .into_builder()
            .id(id)
            .thread_id(thread_id)
            .body(body)
            .build(),
    )
}

/// First ~100 characters of a message body, whitespace collapsed
pub fn snippet_of(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(100)
        .collect()
}
