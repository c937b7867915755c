//! Parsing of fetched messages into mirror records.
//!
//! The client fetches raw RFC 822 bodies in batches; this module turns one
//! raw message (plus its IMAP metadata) into an [`EmailRecord`] and its
//! attachment list. Parsing is tolerant at the stream level: one unparseable
//! response never aborts a batch.

use async_imap::types::{Fetch, Flag};
use chrono::{DateTime, FixedOffset, Utc};
use futures::{Stream, StreamExt};
use mailparse::{MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::error::{Result, WardenError};
use crate::types::{parse_address, AttachmentMeta, EmailRecord};

/// Messages larger than this are rejected before the body round-trip.
pub const MAX_MESSAGE_SIZE: u32 = 50 * 1024 * 1024;

/// Default batch size for headers-only fetches.
pub const HEADER_BATCH_SIZE: usize = 30;

/// Default batch size for full-body fetches.
pub const BODY_BATCH_SIZE: usize = 10;

/// The standard IMAP flags we mirror.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagSet {
    pub seen: bool,
    pub flagged: bool,
    pub draft: bool,
    pub deleted: bool,
}

impl FlagSet {
    pub fn from_fetch(fetch: &Fetch) -> Self {
        let mut set = Self::default();
        for flag in fetch.flags() {
            match flag {
                Flag::Seen => set.seen = true,
                Flag::Flagged => set.flagged = true,
                Flag::Draft => set.draft = true,
                Flag::Deleted => set.deleted = true,
                _ => {}
            }
        }
        set
    }
}

/// Collect a FETCH stream tolerantly: responses that fail to parse are
/// logged and skipped instead of failing the whole batch.
pub async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl Stream<Item = std::result::Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("skipping unparseable IMAP response ({}): {}", context, e);
            }
        }
    }
    items
}

fn folder_kind(folder: &str) -> (bool, bool, bool) {
    let lower = folder.to_lowercase();
    let is_sent = lower.contains("sent");
    let is_trash = lower.contains("trash") || lower.contains("bin");
    let is_spam = lower.contains("spam") || lower.contains("junk");
    (is_sent, is_trash, is_spam)
}

fn header_section(raw: &[u8]) -> String {
    let boundary = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n"))
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..boundary]).to_string()
}

fn address_list(parsed: &ParsedMail<'_>, header: &str) -> Vec<String> {
    parsed
        .headers
        .get_all_values(header)
        .iter()
        .flat_map(|value| value.split(','))
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn reference_ids(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .filter(|token| token.starts_with('<') && token.ends_with('>'))
        .map(|token| token.to_string())
        .collect()
}

fn snippet_of(body: &str) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(200)
        .collect()
}

fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn collect_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentMeta>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, body_text, body_html, attachments);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let is_attachment =
        disposition.disposition == mailparse::DispositionType::Attachment || filename.is_some();

    if is_attachment {
        let filename = filename.unwrap_or_else(|| "unnamed".to_string());
        let size = part.get_body_raw().map(|b| b.len() as u32).unwrap_or(0);
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string());
        attachments.push(AttachmentMeta {
            extension: extension_of(&filename),
            mime_type: part.ctype.mimetype.clone(),
            size_bytes: size,
            content_id,
            is_inline: disposition.disposition == mailparse::DispositionType::Inline,
            filename,
        });
        return;
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" => {
            if body_text.is_none() {
                *body_text = part.get_body().ok();
            }
        }
        "text/html" => {
            if body_html.is_none() {
                *body_html = part.get_body().ok();
            }
        }
        _ => {}
    }
}

/// Parse one raw RFC 822 message into a mirror record. `raw` may be a full
/// body or just the header section (for headers-only fetches).
pub fn parse_message(
    folder: &str,
    uid: u32,
    flags: &FlagSet,
    size: Option<u32>,
    internal_date: Option<DateTime<FixedOffset>>,
    raw: &[u8],
) -> Result<(EmailRecord, Vec<AttachmentMeta>)> {
    let parsed = mailparse::parse_mail(raw)?;

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            WardenError::Parse(format!("message without Message-ID (uid {})", uid))
        })?;

    let in_reply_to = parsed
        .headers
        .get_first_value("In-Reply-To")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let references = parsed
        .headers
        .get_first_value("References")
        .map(|value| reference_ids(&value))
        .unwrap_or_default();

    let thread_id = references
        .first()
        .cloned()
        .or_else(|| in_reply_to.clone())
        .unwrap_or_else(|| message_id.clone());

    let date_sent = parsed
        .headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    let (from_name, from_address) = parsed
        .headers
        .get_first_value("From")
        .map(|value| parse_address(&value))
        .unwrap_or((None, String::new()));

    let subject = parsed.headers.get_first_value("Subject");

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    collect_parts(&parsed, &mut body_text, &mut body_html, &mut attachments);

    let snippet = body_text.as_deref().map(snippet_of).filter(|s| !s.is_empty());
    let (is_sent, folder_trash, is_spam) = folder_kind(folder);

    let record = EmailRecord {
        id: 0,
        message_id,
        uid: Some(uid),
        folder: folder.to_string(),
        thread_id: Some(thread_id),
        in_reply_to,
        references,
        date_sent,
        date_received: internal_date
            .map(|d| d.with_timezone(&Utc))
            .or_else(|| Some(Utc::now())),
        from_address,
        from_name,
        to_addresses: address_list(&parsed, "To"),
        cc_addresses: address_list(&parsed, "Cc"),
        bcc_addresses: address_list(&parsed, "Bcc"),
        subject,
        snippet,
        is_read: flags.seen,
        is_starred: flags.flagged,
        is_important: false,
        is_draft: flags.draft,
        is_sent,
        is_trash: flags.deleted || folder_trash,
        is_spam,
        labels: Vec::new(),
        size_bytes: size,
        attachment_count: attachments.len() as u32,
        raw_headers: Some(header_section(raw)),
        body_text,
        body_html,
    };

    Ok((record, attachments))
}

/// Render a UID slice as the comma-separated set FETCH expects.
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "Message-ID: <msg-1@example.com>\r\n\
        Date: Tue, 14 Nov 2023 22:13:20 +0000\r\n\
        From: Boss <Boss@Company.com>\r\n\
        To: me@example.com, Other <other@example.com>\r\n\
        Subject: Production outage\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        The primary database is down. Please respond immediately.\r\n";

    const MULTIPART: &str = "Message-ID: <msg-2@example.com>\r\n\
        From: sender@example.com\r\n\
        In-Reply-To: <msg-1@example.com>\r\n\
        References: <root@example.com> <msg-1@example.com>\r\n\
        Subject: Re: report\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
        \r\n\
        --b1\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        See attached.\r\n\
        --b1\r\n\
        Content-Type: application/pdf; name=\"report.pdf\"\r\n\
        Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
        Content-Transfer-Encoding: base64\r\n\
        \r\n\
        JVBERi0=\r\n\
        --b1--\r\n";

    #[test]
    fn parses_simple_message() {
        let flags = FlagSet {
            seen: true,
            ..Default::default()
        };
        let (record, attachments) =
            parse_message("INBOX", 42, &flags, Some(1024), None, SIMPLE.as_bytes()).unwrap();

        assert_eq!(record.message_id, "<msg-1@example.com>");
        assert_eq!(record.uid, Some(42));
        assert_eq!(record.from_address, "boss@company.com");
        assert_eq!(record.from_name.as_deref(), Some("Boss"));
        assert_eq!(record.subject.as_deref(), Some("Production outage"));
        assert_eq!(record.to_addresses.len(), 2);
        assert!(record.is_read);
        assert!(!record.is_starred);
        assert!(record.body_text.as_deref().unwrap().contains("primary database"));
        assert!(record.snippet.as_deref().unwrap().starts_with("The primary"));
        assert_eq!(record.size_bytes, Some(1024));
        assert!(record.raw_headers.as_deref().unwrap().contains("Message-ID"));
        assert!(attachments.is_empty());
        // No references, so the message threads on itself.
        assert_eq!(record.thread_id.as_deref(), Some("<msg-1@example.com>"));
    }

    #[test]
    fn parses_multipart_with_attachment() {
        let (record, attachments) = parse_message(
            "INBOX",
            7,
            &FlagSet::default(),
            None,
            None,
            MULTIPART.as_bytes(),
        )
        .unwrap();

        assert!(record.body_text.as_deref().unwrap().contains("See attached."));
        assert_eq!(record.attachment_count, 1);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "report.pdf");
        assert_eq!(attachments[0].mime_type, "application/pdf");
        assert_eq!(attachments[0].extension.as_deref(), Some("pdf"));
        assert!(!attachments[0].is_inline);
        assert!(attachments[0].size_bytes > 0);
        // Thread correlators come from the References chain.
        assert_eq!(record.thread_id.as_deref(), Some("<root@example.com>"));
        assert_eq!(record.in_reply_to.as_deref(), Some("<msg-1@example.com>"));
        assert_eq!(record.references.len(), 2);
    }

    #[test]
    fn missing_message_id_is_a_parse_error() {
        let raw = "From: a@b.c\r\nSubject: no id\r\n\r\nbody\r\n";
        let err = parse_message("INBOX", 1, &FlagSet::default(), None, None, raw.as_bytes())
            .unwrap_err();
        assert!(matches!(err, WardenError::Parse(_)));
    }

    #[test]
    fn folder_determines_derived_flags() {
        let raw = "Message-ID: <s@x>\r\nFrom: a@b.c\r\n\r\nhi\r\n";
        let (record, _) = parse_message(
            "[Gmail]/Sent Mail",
            1,
            &FlagSet::default(),
            None,
            None,
            raw.as_bytes(),
        )
        .unwrap();
        assert!(record.is_sent);
        assert!(!record.is_spam);

        let (record, _) =
            parse_message("Spam", 1, &FlagSet::default(), None, None, raw.as_bytes()).unwrap();
        assert!(record.is_spam);
    }

    #[test]
    fn snippet_is_capped_at_200_chars() {
        let long_body = "word ".repeat(200);
        let raw = format!(
            "Message-ID: <s@x>\r\nFrom: a@b.c\r\nContent-Type: text/plain\r\n\r\n{}",
            long_body
        );
        let (record, _) =
            parse_message("INBOX", 1, &FlagSet::default(), None, None, raw.as_bytes()).unwrap();
        assert_eq!(record.snippet.unwrap().chars().count(), 200);
    }

    #[test]
    fn uid_set_joins_with_commas() {
        assert_eq!(uid_set(&[1, 2, 30]), "1,2,30");
        assert_eq!(uid_set(&[]), "");
    }
}
