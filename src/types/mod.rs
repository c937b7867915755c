//! Core data types shared across the engine: the mirrored email record, its
//! owned attachments and recipients, the event union handed to listeners, and
//! the notification shape emitted to the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One mirrored message. Keyed by the RFC 5322 Message-ID; `id` is the store's
/// surrogate key and is 0 until the record has been upserted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: i64,
    pub message_id: String,
    /// Server UID, scoped to `folder`. Absent for rows mirrored before the
    /// UID column existed.
    pub uid: Option<u32>,
    pub folder: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub date_sent: Option<DateTime<Utc>>,
    pub date_received: Option<DateTime<Utc>>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// First 200 characters of the plain body.
    pub snippet: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub is_draft: bool,
    pub is_sent: bool,
    pub is_trash: bool,
    pub is_spam: bool,
    pub labels: Vec<String>,
    pub size_bytes: Option<u32>,
    pub attachment_count: u32,
    pub raw_headers: Option<String>,
}

/// Attachment metadata, owned by its parent email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u32,
    pub content_id: Option<String>,
    pub is_inline: bool,
    /// Lowercased filename extension, derived at parse time.
    pub extension: Option<String>,
}

/// Recipient kind within an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }
}

/// A normalized recipient row, owned by its parent email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    /// Lowercased address.
    pub address: String,
    pub name: Option<String>,
    /// Host part after `@`, lowercased.
    pub domain: String,
}

/// Event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EmailReceived,
    EmailSent,
    EmailStarred,
    EmailArchived,
    EmailLabeled,
    ScheduledTime,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EmailReceived => "email_received",
            Self::EmailSent => "email_sent",
            Self::EmailStarred => "email_starred",
            Self::EmailArchived => "email_archived",
            Self::EmailLabeled => "email_labeled",
            Self::ScheduledTime => "scheduled_time",
        };
        f.write_str(name)
    }
}

/// Tagged event payload dispatched to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmailEvent {
    EmailReceived { email: EmailRecord },
    EmailSent { email: EmailRecord },
    EmailStarred { email: EmailRecord },
    EmailArchived { email: EmailRecord },
    EmailLabeled { email: EmailRecord, label: String },
    ScheduledTime { timestamp: DateTime<Utc>, cron: Option<String> },
}

impl EmailEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EmailReceived { .. } => EventKind::EmailReceived,
            Self::EmailSent { .. } => EventKind::EmailSent,
            Self::EmailStarred { .. } => EventKind::EmailStarred,
            Self::EmailArchived { .. } => EventKind::EmailArchived,
            Self::EmailLabeled { .. } => EventKind::EmailLabeled,
            Self::ScheduledTime { .. } => EventKind::ScheduledTime,
        }
    }

    /// The email carried by the event, if any.
    pub fn email(&self) -> Option<&EmailRecord> {
        match self {
            Self::EmailReceived { email }
            | Self::EmailSent { email }
            | Self::EmailStarred { email }
            | Self::EmailArchived { email }
            | Self::EmailLabeled { email, .. } => Some(email),
            Self::ScheduledTime { .. } => None,
        }
    }

    /// The label carried by a labeled event.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::EmailLabeled { label, .. } => Some(label),
            _ => None,
        }
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Notification emitted by a listener through its context. Delivered to the
/// host over the notification channel; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub listener_id: String,
    pub listener_name: String,
    pub priority: Priority,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Message-ID of the email the notification refers to, if any.
    pub email_ref: Option<String>,
}

/// Parse a `Display Name <addr@host>` string into `(name, lowercased addr)`.
pub fn parse_address(input: &str) -> (Option<String>, String) {
    let trimmed = input.trim();

    if let (Some(start), Some(end)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
        if end > start {
            let address = trimmed[start + 1..end].trim().to_lowercase();
            let name = trimmed[..start].trim().trim_matches('"').trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
            return (name, address);
        }
    }

    (None, trimmed.to_lowercase())
}

/// Derive the domain part of an address, lowercased.
pub fn address_domain(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, host)| host.to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_name_form() {
        let (name, addr) = parse_address("John Doe <John@Example.com>");
        assert_eq!(name.as_deref(), Some("John Doe"));
        assert_eq!(addr, "john@example.com");
    }

    #[test]
    fn parses_bare_address() {
        let (name, addr) = parse_address("jane@example.com");
        assert!(name.is_none());
        assert_eq!(addr, "jane@example.com");
    }

    #[test]
    fn parses_quoted_name() {
        let (name, addr) = parse_address("\"Jane Doe\" <jane@example.com>");
        assert_eq!(name.as_deref(), Some("Jane Doe"));
        assert_eq!(addr, "jane@example.com");
    }

    #[test]
    fn domain_is_lowercased() {
        assert_eq!(address_domain("a@Example.COM"), "example.com");
        assert_eq!(address_domain("no-at-sign"), "");
    }

    #[test]
    fn event_kind_matches_payload() {
        let event = EmailEvent::EmailLabeled {
            email: EmailRecord::default(),
            label: "work".to_string(),
        };
        assert_eq!(event.kind(), EventKind::EmailLabeled);
        assert_eq!(event.label(), Some("work"));
        assert!(event.email().is_some());
    }
}
