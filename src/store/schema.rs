use rusqlite::Connection;

use crate::error::Result;

/// Create all tables, indexes, and the full-text index. Idempotent; called on
/// every open. WAL and foreign keys are set per-connection by the pool.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Mirror of the remote mailbox, keyed by RFC Message-ID.
        CREATE TABLE IF NOT EXISTS emails (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id      TEXT NOT NULL UNIQUE,
            uid             INTEGER,            -- server UID, scoped to folder
            folder          TEXT NOT NULL,
            thread_id       TEXT,
            in_reply_to     TEXT,
            references_ids  TEXT DEFAULT '[]',  -- JSON array of Message-IDs
            date_sent       INTEGER,            -- unix epoch seconds
            date_received   INTEGER,
            from_address    TEXT NOT NULL,
            from_name       TEXT,
            to_addresses    TEXT DEFAULT '[]',  -- JSON array
            cc_addresses    TEXT DEFAULT '[]',
            bcc_addresses   TEXT DEFAULT '[]',
            subject         TEXT,
            body_text       TEXT,
            body_html       TEXT,
            snippet         TEXT,
            is_read         INTEGER NOT NULL DEFAULT 0,
            is_starred      INTEGER NOT NULL DEFAULT 0,
            is_important    INTEGER NOT NULL DEFAULT 0,
            is_draft        INTEGER NOT NULL DEFAULT 0,
            is_sent         INTEGER NOT NULL DEFAULT 0,
            is_trash        INTEGER NOT NULL DEFAULT 0,
            is_spam         INTEGER NOT NULL DEFAULT 0,
            labels          TEXT DEFAULT '[]',  -- JSON array, unordered set
            size_bytes      INTEGER,
            attachment_count INTEGER NOT NULL DEFAULT 0,
            raw_headers     TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        -- (folder, uid) is unique within the account when the UID is known.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_emails_folder_uid
            ON emails(folder, uid) WHERE uid IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_emails_date_sent   ON emails(date_sent DESC);
        CREATE INDEX IF NOT EXISTS idx_emails_from        ON emails(from_address);
        CREATE INDEX IF NOT EXISTS idx_emails_thread      ON emails(thread_id);
        CREATE INDEX IF NOT EXISTS idx_emails_message_id  ON emails(message_id);
        CREATE INDEX IF NOT EXISTS idx_emails_read        ON emails(is_read);
        CREATE INDEX IF NOT EXISTS idx_emails_starred     ON emails(is_starred);
        CREATE INDEX IF NOT EXISTS idx_emails_folder      ON emails(folder);
        CREATE INDEX IF NOT EXISTS idx_emails_attachments ON emails(attachment_count);

        -- Normalized recipients, cascade-deleted with the parent email.
        CREATE TABLE IF NOT EXISTS recipients (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id    INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            kind        TEXT NOT NULL CHECK (kind IN ('to', 'cc', 'bcc')),
            address     TEXT NOT NULL,
            name        TEXT,
            domain      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_recipients_email   ON recipients(email_id);
        CREATE INDEX IF NOT EXISTS idx_recipients_address ON recipients(address);
        CREATE INDEX IF NOT EXISTS idx_recipients_domain  ON recipients(domain);
        CREATE INDEX IF NOT EXISTS idx_recipients_kind    ON recipients(kind);

        -- Attachment metadata, cascade-deleted with the parent email.
        CREATE TABLE IF NOT EXISTS attachments (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id    INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            filename    TEXT NOT NULL,
            mime_type   TEXT NOT NULL,
            size_bytes  INTEGER NOT NULL DEFAULT 0,
            content_id  TEXT,
            is_inline   INTEGER NOT NULL DEFAULT 0,
            extension   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_email     ON attachments(email_id);
        CREATE INDEX IF NOT EXISTS idx_attachments_extension ON attachments(extension);

        -- Full-text index over the searchable surface of an email. The row is
        -- rewritten inside the same transaction as every emails mutation;
        -- rowid mirrors emails.id.
        CREATE VIRTUAL TABLE IF NOT EXISTS emails_fts USING fts5(
            message_id UNINDEXED,
            subject,
            from_address,
            from_name,
            body_text,
            recipients,
            attachment_names,
            tokenize = 'porter unicode61'
        );

        -- Log of sync runs, observability only.
        CREATE TABLE IF NOT EXISTS sync_metadata (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            ran_at          INTEGER NOT NULL,
            emails_synced   INTEGER NOT NULL DEFAULT 0,
            emails_skipped  INTEGER NOT NULL DEFAULT 0,
            errors          INTEGER NOT NULL DEFAULT 0,
            sync_type       TEXT NOT NULL CHECK (sync_type IN ('manual', 'idle', 'scheduled'))
        );
        ",
    )?;

    Ok(())
}
