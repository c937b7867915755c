//! SQLite mirror of the remote mailbox.
//!
//! The store is the single local source of truth: sync upserts into it,
//! listeners read from it, and every listener-driven mutation goes through
//! `update_email_flags`. Writes are serialized through the connection pool;
//! each upsert is one transaction covering the email row, its recipients and
//! attachments, and the full-text index row.

mod schema;
mod search;

pub use search::{SearchCriteria, DEFAULT_SEARCH_LIMIT};

use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WardenError};
use crate::types::{
    address_domain, parse_address, AttachmentMeta, EmailRecord, Recipient, RecipientKind,
};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Kind of a sync run, recorded in `sync_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Manual,
    Idle,
    Scheduled,
}

impl SyncKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
        }
    }
}

/// One recorded sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub ran_at: DateTime<Utc>,
    pub emails_synced: u32,
    pub emails_skipped: u32,
    pub errors: u32,
    pub sync_type: SyncKind,
}

/// Partial flag update. Only the fields that are `Some` are applied.
#[derive(Debug, Clone, Default)]
pub struct FlagUpdate {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub is_important: Option<bool>,
    pub labels: Option<Vec<String>>,
    pub folder: Option<String>,
}

/// Store-level counters for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_emails: i64,
    pub unread: i64,
    pub starred: i64,
    pub with_attachments: i64,
    pub attachments: i64,
    pub recipients: i64,
}

pub struct MailStore {
    pool: DbPool,
}

fn pool_with(manager: SqliteConnectionManager, max_size: u32) -> Result<DbPool> {
    let manager = manager.with_init(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
    });
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(WardenError::from)
}

impl MailStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = pool_with(SqliteConnectionManager::file(path), 8)?;
        let store = Self { pool };
        schema::initialize_schema(&*store.conn()?)?;
        Ok(store)
    }

    /// In-memory database. Pool size 1 so every handle sees the same data.
    pub fn open_in_memory() -> Result<Self> {
        let pool = pool_with(SqliteConnectionManager::memory(), 1)?;
        let store = Self { pool };
        schema::initialize_schema(&*store.conn()?)?;
        Ok(store)
    }

    fn conn(&self) -> Result<DbConnection> {
        self.pool.get().map_err(WardenError::from)
    }

    /// Insert or update one email. Matching is by `message_id`; on update all
    /// mutable fields are rewritten and attachments fully replaced. The email
    /// row, recipients, attachments, and the FTS row commit in one
    /// transaction. Returns the row's surrogate key.
    pub fn upsert_email(&self, record: &EmailRecord, attachments: &[AttachmentMeta]) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM emails WHERE message_id = ?1",
                params![record.message_id],
                |row| row.get(0),
            )
            .optional()?;

        let references_json = serde_json::to_string(&record.references)?;
        let to_json = serde_json::to_string(&record.to_addresses)?;
        let cc_json = serde_json::to_string(&record.cc_addresses)?;
        let bcc_json = serde_json::to_string(&record.bcc_addresses)?;
        let labels_json = serde_json::to_string(&record.labels)?;

        let email_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE emails SET
                        uid = ?1, folder = ?2, thread_id = ?3, in_reply_to = ?4,
                        references_ids = ?5, date_sent = ?6, date_received = ?7,
                        from_address = ?8, from_name = ?9, to_addresses = ?10,
                        cc_addresses = ?11, bcc_addresses = ?12, subject = ?13,
                        body_text = ?14, body_html = ?15, snippet = ?16,
                        is_read = ?17, is_starred = ?18, is_important = ?19,
                        is_draft = ?20, is_sent = ?21, is_trash = ?22, is_spam = ?23,
                        labels = ?24, size_bytes = ?25, attachment_count = ?26,
                        raw_headers = ?27, updated_at = ?28
                     WHERE id = ?29",
                    params![
                        record.uid,
                        record.folder,
                        record.thread_id,
                        record.in_reply_to,
                        references_json,
                        record.date_sent.map(|d| d.timestamp()),
                        record.date_received.map(|d| d.timestamp()),
                        record.from_address,
                        record.from_name,
                        to_json,
                        cc_json,
                        bcc_json,
                        record.subject,
                        record.body_text,
                        record.body_html,
                        record.snippet,
                        record.is_read,
                        record.is_starred,
                        record.is_important,
                        record.is_draft,
                        record.is_sent,
                        record.is_trash,
                        record.is_spam,
                        labels_json,
                        record.size_bytes,
                        attachments.len() as i64,
                        record.raw_headers,
                        now,
                        id,
                    ],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO emails (
                        message_id, uid, folder, thread_id, in_reply_to,
                        references_ids, date_sent, date_received, from_address,
                        from_name, to_addresses, cc_addresses, bcc_addresses,
                        subject, body_text, body_html, snippet, is_read,
                        is_starred, is_important, is_draft, is_sent, is_trash,
                        is_spam, labels, size_bytes, attachment_count,
                        raw_headers, created_at, updated_at
                     ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                        ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                        ?25, ?26, ?27, ?28, ?29, ?30
                     )",
                    params![
                        record.message_id,
                        record.uid,
                        record.folder,
                        record.thread_id,
                        record.in_reply_to,
                        references_json,
                        record.date_sent.map(|d| d.timestamp()),
                        record.date_received.map(|d| d.timestamp()),
                        record.from_address,
                        record.from_name,
                        to_json,
                        cc_json,
                        bcc_json,
                        record.subject,
                        record.body_text,
                        record.body_html,
                        record.snippet,
                        record.is_read,
                        record.is_starred,
                        record.is_important,
                        record.is_draft,
                        record.is_sent,
                        record.is_trash,
                        record.is_spam,
                        labels_json,
                        record.size_bytes,
                        attachments.len() as i64,
                        record.raw_headers,
                        now,
                        now,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        // Full replacement of the owned rows.
        tx.execute("DELETE FROM recipients WHERE email_id = ?1", params![email_id])?;
        tx.execute("DELETE FROM attachments WHERE email_id = ?1", params![email_id])?;

        let mut recipient_addresses: Vec<String> = Vec::new();
        {
            let mut insert = tx.prepare(
                "INSERT INTO recipients (email_id, kind, address, name, domain)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let groups = [
                (RecipientKind::To, &record.to_addresses),
                (RecipientKind::Cc, &record.cc_addresses),
                (RecipientKind::Bcc, &record.bcc_addresses),
            ];
            for (kind, addresses) in groups {
                for raw in addresses {
                    let (name, address) = parse_address(raw);
                    if address.is_empty() {
                        continue;
                    }
                    let domain = address_domain(&address);
                    insert.execute(params![email_id, kind.as_str(), address, name, domain])?;
                    recipient_addresses.push(address);
                }
            }
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO attachments (email_id, filename, mime_type, size_bytes,
                                          content_id, is_inline, extension)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for attachment in attachments {
                insert.execute(params![
                    email_id,
                    attachment.filename,
                    attachment.mime_type,
                    attachment.size_bytes,
                    attachment.content_id,
                    attachment.is_inline,
                    attachment.extension,
                ])?;
            }
        }

        // Rewrite the FTS row in the same transaction.
        tx.execute("DELETE FROM emails_fts WHERE rowid = ?1", params![email_id])?;
        let attachment_names = attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        tx.execute(
            "INSERT INTO emails_fts (rowid, message_id, subject, from_address,
                                     from_name, body_text, recipients, attachment_names)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                email_id,
                record.message_id,
                record.subject,
                record.from_address,
                record.from_name,
                record.body_text,
                recipient_addresses.join(" "),
                attachment_names,
            ],
        )?;

        tx.commit()?;
        Ok(email_id)
    }

    /// Look a message up by its Message-ID.
    pub fn get_by_message_id(&self, message_id: &str) -> Result<Option<EmailRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE message_id = ?1", SELECT_EMAIL),
            params![message_id],
            row_to_email,
        )
        .optional()
        .map_err(WardenError::from)
    }

    /// Whether a message is already mirrored.
    pub fn contains_message_id(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch by surrogate keys, newest first.
    pub fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<EmailRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let marks = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "{} WHERE id IN ({}) ORDER BY date_sent DESC",
            SELECT_EMAIL, marks
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(ids.iter().map(|id| Value::Integer(*id))),
            row_to_email,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(WardenError::from)
    }

    /// Fetch by Message-IDs, newest first.
    pub fn get_by_message_ids(&self, ids: &[String]) -> Result<Vec<EmailRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let marks = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "{} WHERE message_id IN ({}) ORDER BY date_sent DESC",
            SELECT_EMAIL, marks
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(ids.iter().map(|id| Value::Text(id.clone()))),
            row_to_email,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(WardenError::from)
    }

    /// Search the mirror. Results come back newest first, paginated through
    /// `limit` (default 30) and `offset`.
    pub fn search_emails(&self, criteria: &SearchCriteria) -> Result<Vec<EmailRecord>> {
        let filter = search::build_filter(criteria);
        let limit = criteria.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let offset = criteria.offset.unwrap_or(0);

        let sql = format!(
            "{} WHERE {} ORDER BY date_sent DESC LIMIT {} OFFSET {}",
            SELECT_EMAIL, filter.clause, limit, offset
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(filter.params), row_to_email)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(WardenError::from)
    }

    /// Newest messages in INBOX and All Mail.
    pub fn recent_emails(&self, limit: u32, include_read: bool) -> Result<Vec<EmailRecord>> {
        let read_clause = if include_read { "" } else { "AND is_read = 0" };
        let sql = format!(
            "{} WHERE folder IN ('INBOX', '[Gmail]/All Mail') {} \
             ORDER BY date_sent DESC LIMIT {}",
            SELECT_EMAIL, read_clause, limit
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_email)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(WardenError::from)
    }

    /// Apply a partial flag update to one message. This is the single local
    /// write path after ingest; listener-driven mutations all land here.
    pub fn update_email_flags(&self, message_id: &str, update: &FlagUpdate) -> Result<()> {
        let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
        let mut values: Vec<Value> = vec![Value::Integer(Utc::now().timestamp())];

        if let Some(read) = update.is_read {
            sets.push("is_read = ?".to_string());
            values.push(Value::Integer(read as i64));
        }
        if let Some(starred) = update.is_starred {
            sets.push("is_starred = ?".to_string());
            values.push(Value::Integer(starred as i64));
        }
        if let Some(important) = update.is_important {
            sets.push("is_important = ?".to_string());
            values.push(Value::Integer(important as i64));
        }
        if let Some(labels) = &update.labels {
            sets.push("labels = ?".to_string());
            values.push(Value::Text(serde_json::to_string(labels)?));
        }
        if let Some(folder) = &update.folder {
            sets.push("folder = ?".to_string());
            values.push(Value::Text(folder.clone()));
        }

        let sql = format!(
            "UPDATE emails SET {} WHERE message_id = ?",
            sets.join(", ")
        );
        values.push(Value::Text(message_id.to_string()));

        let conn = self.conn()?;
        let changed = conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(WardenError::NotFound(format!(
                "no mirrored email with message id {}",
                message_id
            )));
        }
        debug!(message_id, "applied local flag update");
        Ok(())
    }

    /// Attachments owned by an email.
    pub fn attachments_for(&self, email_id: i64) -> Result<Vec<AttachmentMeta>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT filename, mime_type, size_bytes, content_id, is_inline, extension
             FROM attachments WHERE email_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![email_id], |row| {
            Ok(AttachmentMeta {
                filename: row.get(0)?,
                mime_type: row.get(1)?,
                size_bytes: row.get(2)?,
                content_id: row.get(3)?,
                is_inline: row.get(4)?,
                extension: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(WardenError::from)
    }

    /// Recipients owned by an email.
    pub fn recipients_for(&self, email_id: i64) -> Result<Vec<Recipient>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, address, name, domain FROM recipients
             WHERE email_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![email_id], |row| {
            let kind: String = row.get(0)?;
            Ok(Recipient {
                kind: match kind.as_str() {
                    "cc" => RecipientKind::Cc,
                    "bcc" => RecipientKind::Bcc,
                    _ => RecipientKind::To,
                },
                address: row.get(1)?,
                name: row.get(2)?,
                domain: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(WardenError::from)
    }

    /// Most recent send date in the mirror; drives incremental sync.
    pub fn latest_sent_date(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let ts: Option<i64> =
            conn.query_row("SELECT MAX(date_sent) FROM emails", [], |row| row.get(0))?;
        Ok(ts.and_then(|t| DateTime::from_timestamp(t, 0)))
    }

    /// Append a sync run to the log.
    pub fn record_sync_run(&self, run: &SyncRunRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_metadata (ran_at, emails_synced, emails_skipped, errors, sync_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.ran_at.timestamp(),
                run.emails_synced,
                run.emails_skipped,
                run.errors,
                run.sync_type.as_str(),
            ],
        )?;
        Ok(())
    }

    /// The most recent sync run, if any.
    pub fn last_sync_run(&self) -> Result<Option<SyncRunRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT ran_at, emails_synced, emails_skipped, errors, sync_type
             FROM sync_metadata ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let ts: i64 = row.get(0)?;
                let kind: String = row.get(4)?;
                Ok(SyncRunRecord {
                    ran_at: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
                    emails_synced: row.get(1)?,
                    emails_skipped: row.get(2)?,
                    errors: row.get(3)?,
                    sync_type: match kind.as_str() {
                        "idle" => SyncKind::Idle,
                        "scheduled" => SyncKind::Scheduled,
                        _ => SyncKind::Manual,
                    },
                })
            },
        )
        .optional()
        .map_err(WardenError::from)
    }

    /// Counters for observability.
    pub fn statistics(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let single = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0))
                .map_err(WardenError::from)
        };
        Ok(StoreStats {
            total_emails: single("SELECT COUNT(*) FROM emails")?,
            unread: single("SELECT COUNT(*) FROM emails WHERE is_read = 0")?,
            starred: single("SELECT COUNT(*) FROM emails WHERE is_starred = 1")?,
            with_attachments: single("SELECT COUNT(*) FROM emails WHERE attachment_count > 0")?,
            attachments: single("SELECT COUNT(*) FROM attachments")?,
            recipients: single("SELECT COUNT(*) FROM recipients")?,
        })
    }

    /// Delete a message and its owned rows. Used by tests and retention
    /// tooling; sync never deletes.
    pub fn delete_email(&self, message_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM emails WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = id {
            tx.execute("DELETE FROM emails WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM emails_fts WHERE rowid = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }
}

const SELECT_EMAIL: &str = "SELECT id, message_id, uid, folder, thread_id, in_reply_to,
    references_ids, date_sent, date_received, from_address, from_name,
    to_addresses, cc_addresses, bcc_addresses, subject, body_text, body_html,
    snippet, is_read, is_starred, is_important, is_draft, is_sent, is_trash,
    is_spam, labels, size_bytes, attachment_count, raw_headers
    FROM emails";

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn row_to_email(row: &Row<'_>) -> rusqlite::Result<EmailRecord> {
    let date_sent: Option<i64> = row.get(7)?;
    let date_received: Option<i64> = row.get(8)?;
    Ok(EmailRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        uid: row.get(2)?,
        folder: row.get(3)?,
        thread_id: row.get(4)?,
        in_reply_to: row.get(5)?,
        references: json_list(row.get(6)?),
        date_sent: date_sent.and_then(|t| DateTime::from_timestamp(t, 0)),
        date_received: date_received.and_then(|t| DateTime::from_timestamp(t, 0)),
        from_address: row.get(9)?,
        from_name: row.get(10)?,
        to_addresses: json_list(row.get(11)?),
        cc_addresses: json_list(row.get(12)?),
        bcc_addresses: json_list(row.get(13)?),
        subject: row.get(14)?,
        body_text: row.get(15)?,
        body_html: row.get(16)?,
        snippet: row.get(17)?,
        is_read: row.get(18)?,
        is_starred: row.get(19)?,
        is_important: row.get(20)?,
        is_draft: row.get(21)?,
        is_sent: row.get(22)?,
        is_trash: row.get(23)?,
        is_spam: row.get(24)?,
        labels: json_list(row.get(25)?),
        size_bytes: row.get(26)?,
        attachment_count: row.get::<_, i64>(27)? as u32,
        raw_headers: row.get(28)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message_id: &str, uid: u32) -> EmailRecord {
        EmailRecord {
            message_id: message_id.to_string(),
            uid: Some(uid),
            folder: "INBOX".to_string(),
            from_address: "news@noreply.site".to_string(),
            from_name: Some("Newsletter".to_string()),
            to_addresses: vec!["Me <me@example.com>".to_string()],
            subject: Some("Weekly digest zanzibar".to_string()),
            body_text: Some("The quick brown fox jumps over the lazy dog.".to_string()),
            snippet: Some("The quick brown fox".to_string()),
            date_sent: DateTime::from_timestamp(1_700_000_000, 0),
            size_bytes: Some(2048),
            ..Default::default()
        }
    }

    fn attachment(name: &str) -> AttachmentMeta {
        AttachmentMeta {
            filename: name.to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 512,
            content_id: None,
            is_inline: false,
            extension: Some("pdf".to_string()),
        }
    }

    #[test]
    fn upsert_round_trips() {
        let store = MailStore::open_in_memory().unwrap();
        let rec = record("<a@x>", 11);
        let id = store.upsert_email(&rec, &[attachment("invoice.pdf")]).unwrap();
        assert!(id > 0);

        let fetched = store.get_by_message_id("<a@x>").unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.uid, Some(11));
        assert_eq!(fetched.folder, "INBOX");
        assert_eq!(fetched.subject.as_deref(), Some("Weekly digest zanzibar"));
        assert_eq!(fetched.attachment_count, 1);
        assert_eq!(fetched.to_addresses, rec.to_addresses);
        assert_eq!(fetched.date_sent, rec.date_sent);

        let recipients = store.recipients_for(id).unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].address, "me@example.com");
        assert_eq!(recipients[0].domain, "example.com");
        assert_eq!(recipients[0].kind, RecipientKind::To);
    }

    #[test]
    fn upsert_same_message_id_updates_in_place() {
        let store = MailStore::open_in_memory().unwrap();
        let first = store.upsert_email(&record("<a@x>", 11), &[attachment("a.pdf")]).unwrap();
        assert!(store.contains_message_id("<a@x>").unwrap());
        assert!(!store.contains_message_id("<other@x>").unwrap());

        let mut updated = record("<a@x>", 11);
        updated.subject = Some("Updated subject".to_string());
        let second = store
            .upsert_email(&updated, &[attachment("b.pdf"), attachment("c.pdf")])
            .unwrap();

        assert_eq!(first, second);
        let fetched = store.get_by_message_id("<a@x>").unwrap().unwrap();
        assert_eq!(fetched.subject.as_deref(), Some("Updated subject"));
        assert_eq!(fetched.attachment_count, 2);

        // Attachments are fully replaced, not appended.
        let names: Vec<String> = store
            .attachments_for(first)
            .unwrap()
            .into_iter()
            .map(|a| a.filename)
            .collect();
        assert_eq!(names, vec!["b.pdf", "c.pdf"]);
    }

    #[test]
    fn fts_finds_unique_subject_token_and_forgets_after_delete() {
        let store = MailStore::open_in_memory().unwrap();
        store.upsert_email(&record("<a@x>", 11), &[]).unwrap();
        store.upsert_email(&record("<b@x>", 12), &[]).unwrap();

        let criteria = SearchCriteria {
            query: Some("zanzibar".to_string()),
            ..Default::default()
        };
        let hits = store.search_emails(&criteria).unwrap();
        assert_eq!(hits.len(), 2);

        store.delete_email("<a@x>").unwrap();
        let hits = store.search_emails(&criteria).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "<b@x>");
    }

    #[test]
    fn fts_indexes_attachment_names() {
        let store = MailStore::open_in_memory().unwrap();
        store
            .upsert_email(&record("<a@x>", 11), &[attachment("quarterly_budget.pdf")])
            .unwrap();

        let hits = store
            .search_emails(&SearchCriteria {
                query: Some("quarterly_budget".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn flag_update_touches_only_given_fields() {
        let store = MailStore::open_in_memory().unwrap();
        store.upsert_email(&record("<a@x>", 11), &[]).unwrap();

        store
            .update_email_flags(
                "<a@x>",
                &FlagUpdate {
                    is_starred: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let fetched = store.get_by_message_id("<a@x>").unwrap().unwrap();
        assert!(fetched.is_starred);
        assert!(!fetched.is_read);
        assert_eq!(fetched.folder, "INBOX");

        store
            .update_email_flags(
                "<a@x>",
                &FlagUpdate {
                    folder: Some("[Gmail]/All Mail".to_string()),
                    labels: Some(vec!["archived".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();

        let fetched = store.get_by_message_id("<a@x>").unwrap().unwrap();
        assert!(fetched.is_starred);
        assert_eq!(fetched.folder, "[Gmail]/All Mail");
        assert_eq!(fetched.labels, vec!["archived"]);
    }

    #[test]
    fn flag_update_on_unknown_message_fails() {
        let store = MailStore::open_in_memory().unwrap();
        let err = store
            .update_email_flags("<missing@x>", &FlagUpdate::default())
            .unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));
    }

    #[test]
    fn search_filters_compose() {
        let store = MailStore::open_in_memory().unwrap();
        let mut starred = record("<a@x>", 11);
        starred.is_starred = true;
        store.upsert_email(&starred, &[]).unwrap();

        let mut other = record("<b@x>", 12);
        other.from_address = "boss@company.com".to_string();
        store.upsert_email(&other, &[]).unwrap();

        let hits = store
            .search_emails(&SearchCriteria {
                from: vec!["boss@".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "<b@x>");

        let hits = store
            .search_emails(&SearchCriteria {
                is_starred: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "<a@x>");
    }

    #[test]
    fn pagination_applies_limit_and_offset() {
        let store = MailStore::open_in_memory().unwrap();
        for i in 0..5 {
            let mut rec = record(&format!("<{}@x>", i), 100 + i);
            rec.date_sent = DateTime::from_timestamp(1_700_000_000 + i as i64, 0);
            store.upsert_email(&rec, &[]).unwrap();
        }

        let page = store
            .search_emails(&SearchCriteria {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        // Newest first, so offset 1 skips the most recent.
        assert_eq!(page[0].message_id, "<3@x>");
        assert_eq!(page[1].message_id, "<2@x>");
    }

    #[test]
    fn latest_sent_date_tracks_max() {
        let store = MailStore::open_in_memory().unwrap();
        assert!(store.latest_sent_date().unwrap().is_none());

        store.upsert_email(&record("<a@x>", 11), &[]).unwrap();
        let mut newer = record("<b@x>", 12);
        newer.date_sent = DateTime::from_timestamp(1_800_000_000, 0);
        store.upsert_email(&newer, &[]).unwrap();

        assert_eq!(
            store.latest_sent_date().unwrap(),
            DateTime::from_timestamp(1_800_000_000, 0)
        );
    }

    #[test]
    fn sync_runs_are_logged() {
        let store = MailStore::open_in_memory().unwrap();
        assert!(store.last_sync_run().unwrap().is_none());

        store
            .record_sync_run(&SyncRunRecord {
                ran_at: Utc::now(),
                emails_synced: 4,
                emails_skipped: 2,
                errors: 0,
                sync_type: SyncKind::Idle,
            })
            .unwrap();

        let last = store.last_sync_run().unwrap().unwrap();
        assert_eq!(last.emails_synced, 4);
        assert_eq!(last.sync_type, SyncKind::Idle);
    }

    #[test]
    fn statistics_count_rows() {
        let store = MailStore::open_in_memory().unwrap();
        store
            .upsert_email(&record("<a@x>", 11), &[attachment("a.pdf")])
            .unwrap();
        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_emails, 1);
        assert_eq!(stats.unread, 1);
        assert_eq!(stats.with_attachments, 1);
        assert_eq!(stats.attachments, 1);
        assert_eq!(stats.recipients, 1);
    }
}
