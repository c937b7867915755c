//! Sync service: turns a sync request into idempotent upserts plus an
//! `email_received` fan-out.
//!
//! Each run selects the folder, translates the options into a server search,
//! fetches the matching bodies in batches, and walks the results in UID
//! order: messages already mirrored are skipped, everything else is upserted
//! and dispatched. One message failing never aborts the run; a connection
//! failure does.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::imap::ImapClient;
use crate::store::{MailStore, SearchCriteria, SyncKind, SyncRunRecord};
use crate::types::{EmailEvent, EmailRecord};

/// Default lookback when no `since` is given.
const DEFAULT_SINCE_DAYS: i64 = 30;

/// Extra headroom when absorbing an IDLE burst, to cover timing skew.
const IDLE_BURST_SLACK: u32 = 5;
const IDLE_SINCE_SKEW_SECS: i64 = 60;

/// Options for one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    pub folder: String,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub unread_only: bool,
    pub starred_only: bool,
    pub has_attachments: Option<bool>,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    /// Free-text server search.
    pub search: Option<String>,
    pub limit: Option<u32>,
    /// Accepted for wire compatibility; currently carried but not applied.
    pub exclude_folders: Vec<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            since: None,
            before: None,
            from: Vec::new(),
            to: Vec::new(),
            subject: None,
            unread_only: false,
            starred_only: false,
            has_attachments: None,
            min_size: None,
            max_size: None,
            search: None,
            limit: None,
            exclude_folders: Vec::new(),
        }
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: u32,
    pub skipped: u32,
    pub errors: u32,
}

pub struct SyncService {
    store: Arc<MailStore>,
    imap: Arc<ImapClient>,
    dispatcher: Arc<Dispatcher>,
}

/// Translate sync options into the shared search criteria. `since` falls
/// back to the default lookback window.
fn criteria_from(options: &SyncOptions) -> SearchCriteria {
    SearchCriteria {
        query: options.search.clone(),
        from: options.from.clone(),
        to: options.to.clone(),
        subject: options.subject.clone(),
        since: Some(
            options
                .since
                .unwrap_or_else(|| Utc::now() - Duration::days(DEFAULT_SINCE_DAYS)),
        ),
        before: options.before,
        is_unread: options.unread_only.then_some(true),
        is_starred: options.starred_only.then_some(true),
        min_size: options.min_size,
        max_size: options.max_size,
        ..Default::default()
    }
}

/// Filters that can only be confirmed after the body is parsed.
fn passes_post_fetch(options: &SyncOptions, record: &EmailRecord) -> bool {
    if let Some(wanted) = options.has_attachments {
        if (record.attachment_count > 0) != wanted {
            return false;
        }
    }
    true
}

impl SyncService {
    pub fn new(store: Arc<MailStore>, imap: Arc<ImapClient>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            imap,
            dispatcher,
        }
    }

    /// Run one sync. Returns the run counters; the run is also appended to
    /// the sync log.
    pub async fn sync(&self, options: &SyncOptions, kind: SyncKind) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        // A zero limit is a no-op by contract: no fetches, empty report.
        if options.limit == Some(0) {
            return Ok(report);
        }

        let criteria = criteria_from(options);
        let mut uids = self.imap.search_uids(&options.folder, &criteria).await?;
        if let Some(limit) = options.limit {
            // Bound the run by the newest matches.
            if uids.len() > limit as usize {
                let start = uids.len() - limit as usize;
                uids = uids.split_off(start);
            }
        }
        info!(folder = %options.folder, matches = uids.len(), "sync run started");

        let outcome = self.imap.fetch_full(&options.folder, &uids, None).await?;
        report.errors += outcome.errors;

        for mail in outcome.mails {
            match self.store.contains_message_id(&mail.record.message_id) {
                Ok(true) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(uid = mail.uid, "dedup lookup failed: {}", e);
                    report.errors += 1;
                    continue;
                }
            }

            if !passes_post_fetch(options, &mail.record) {
                report.skipped += 1;
                continue;
            }

            let mut record = mail.record;
            match self.store.upsert_email(&record, &mail.attachments) {
                Ok(id) => {
                    record.id = id;
                    report.synced += 1;
                    self.dispatcher
                        .check_event(&EmailEvent::EmailReceived { email: record })
                        .await;
                }
                Err(e) => {
                    error!(uid = mail.uid, "upsert failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        info!(
            synced = report.synced,
            skipped = report.skipped,
            errors = report.errors,
            "sync run finished"
        );
        if let Err(e) = self.store.record_sync_run(&SyncRunRecord {
            ran_at: Utc::now(),
            emails_synced: report.synced,
            emails_skipped: report.skipped,
            errors: report.errors,
            sync_type: kind,
        }) {
            warn!("failed to log sync run: {}", e);
        }

        Ok(report)
    }

    /// Incremental sync: everything newer than the most recent mirrored
    /// send date.
    pub async fn sync_new(&self) -> Result<SyncReport> {
        let since = self.store.latest_sent_date()?;
        let options = SyncOptions {
            since,
            ..Default::default()
        };
        self.sync(&options, SyncKind::Scheduled).await
    }

    /// Absorb one IDLE burst of `count` new messages. The window reaches a
    /// minute back to cover timing skew; message-id dedup keeps the re-entry
    /// idempotent.
    pub async fn handle_idle_event(&self, count: u32) -> Result<SyncReport> {
        let options = SyncOptions {
            since: Some(Utc::now() - Duration::seconds(IDLE_SINCE_SKEW_SECS)),
            limit: Some(count + IDLE_BURST_SLACK),
            ..Default::default()
        };
        self.sync(&options, SyncKind::Idle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCall, AgentRequest};
    use crate::error::WardenError;
    use crate::imap::{ImapConfig, MailOps};
    use crate::listeners::ListenerRegistry;
    use async_trait::async_trait;

    struct NoopAgent;

    #[async_trait]
    impl AgentCall for NoopAgent {
        async fn call(&self, _request: &AgentRequest) -> Result<serde_json::Value> {
            Err(WardenError::Validation("disabled".to_string()))
        }
    }

    struct NoopOps;

    #[async_trait]
    impl MailOps for NoopOps {
        async fn mark_read(&self, _: &str, _: u32, _: bool) -> Result<()> {
            Ok(())
        }
        async fn set_starred(&self, _: &str, _: u32, _: bool) -> Result<()> {
            Ok(())
        }
        async fn archive(&self, _: &str, _: u32) -> Result<()> {
            Ok(())
        }
        async fn store_label(&self, _: &str, _: u32, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
    }

    fn service(tmp: &tempfile::TempDir) -> SyncService {
        let store = Arc::new(MailStore::open_in_memory().unwrap());
        let imap = Arc::new(ImapClient::new(ImapConfig {
            host: "imap.invalid".to_string(),
            port: 993,
            username: "u".to_string(),
            password: "p".to_string(),
        }));
        let (registry, _changes) = ListenerRegistry::new(tmp.path());
        registry.load_all().unwrap();
        let (dispatcher, _notifications) =
            Dispatcher::new(registry, Arc::clone(&store), Arc::new(NoopOps), Arc::new(NoopAgent));
        SyncService::new(store, imap, dispatcher)
    }

    #[test]
    fn criteria_defaults_since_to_thirty_days() {
        let criteria = criteria_from(&SyncOptions::default());
        let since = criteria.since.unwrap();
        let expected = Utc::now() - Duration::days(DEFAULT_SINCE_DAYS);
        assert!((since - expected).num_seconds().abs() < 5);
    }

    #[test]
    fn criteria_carries_filters() {
        let options = SyncOptions {
            from: vec!["boss@company.com".to_string()],
            unread_only: true,
            min_size: Some(100),
            search: Some("invoice".to_string()),
            ..Default::default()
        };
        let criteria = criteria_from(&options);
        assert_eq!(criteria.from, options.from);
        assert_eq!(criteria.is_unread, Some(true));
        assert_eq!(criteria.min_size, Some(100));
        assert_eq!(criteria.query.as_deref(), Some("invoice"));
        // starred_only off means no FLAGGED predicate at all.
        assert_eq!(criteria.is_starred, None);
    }

    #[test]
    fn post_fetch_filter_confirms_attachments() {
        let options = SyncOptions {
            has_attachments: Some(true),
            ..Default::default()
        };
        let mut record = EmailRecord::default();
        assert!(!passes_post_fetch(&options, &record));
        record.attachment_count = 1;
        assert!(passes_post_fetch(&options, &record));
        assert!(passes_post_fetch(&SyncOptions::default(), &record));
    }

    #[tokio::test]
    async fn zero_limit_returns_empty_without_fetching() {
        // The client points at an unreachable host, so any network use
        // would fail the run; limit 0 must short-circuit before it.
        let tmp = tempfile::tempdir().unwrap();
        let service = service(&tmp);
        let report = service
            .sync(
                &SyncOptions {
                    limit: Some(0),
                    ..Default::default()
                },
                SyncKind::Manual,
            )
            .await
            .unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.errors, 0);
    }
}
