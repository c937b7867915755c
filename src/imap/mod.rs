//! IMAP client: the single owner of all remote mailbox interaction.
//!
//! One shared operations session lives behind a mutex; concurrent callers
//! coalesce on the lock, and the first caller through connects on demand.
//! Any terminal command error clears the slot so the next call reconnects.
//! IDLE monitoring runs on its own dedicated connection (see [`idle`]).

mod connection;
mod fetch;
mod idle;
mod search;

pub use connection::{ImapConfig, ImapSession};
pub use fetch::{FlagSet, BODY_BATCH_SIZE, HEADER_BATCH_SIZE, MAX_MESSAGE_SIZE};
pub use idle::NewMailCallback;
pub use search::build_search_expression;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::store::SearchCriteria;
use crate::types::{AttachmentMeta, EmailRecord};

/// Gmail's archive folder. Archiving moves messages here.
pub const ALL_MAIL: &str = "[Gmail]/All Mail";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const HEADER_FETCH_QUERY: &str = "(UID FLAGS RFC822.SIZE INTERNALDATE BODY.PEEK[HEADER])";
const BODY_FETCH_QUERY: &str = "(UID FLAGS RFC822.SIZE INTERNALDATE BODY.PEEK[])";

/// One fully fetched and parsed message.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    pub uid: u32,
    pub record: EmailRecord,
    pub attachments: Vec<AttachmentMeta>,
}

/// Result of a batched body fetch. Per-message failures are logged and
/// counted instead of aborting the batch.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub mails: Vec<FetchedMail>,
    pub errors: u32,
}

/// Remote mutation surface used by the listener context. Kept as a trait so
/// tests can drive the dispatcher with a recording fake.
#[async_trait]
pub trait MailOps: Send + Sync {
    async fn mark_read(&self, folder: &str, uid: u32, read: bool) -> Result<()>;
    async fn set_starred(&self, folder: &str, uid: u32, starred: bool) -> Result<()>;
    /// Move the message to All Mail. A no-op when it is already there.
    async fn archive(&self, folder: &str, uid: u32) -> Result<()>;
    /// Add or remove a Gmail label via the X-GM-LABELS store command.
    async fn store_label(&self, folder: &str, uid: u32, label: &str, add: bool) -> Result<()>;
}

/// The folder cursor: at most one folder is selected at a time, re-selected
/// only when the target folder or access mode changes.
struct SessionSlot {
    session: Option<ImapSession>,
    selected: Option<(String, bool)>, // (folder, read_only)
}

pub struct ImapClient {
    config: ImapConfig,
    slot: Mutex<SessionSlot>,
    idle_started: AtomicBool,
    idle_stop: Arc<AtomicBool>,
    idle_active: Arc<AtomicBool>,
}

/// Clear the slot after a terminal command error so the next caller
/// reconnects, and surface the failure.
fn poison(slot: &mut SessionSlot, what: &str, err: impl std::fmt::Display) -> WardenError {
    slot.session = None;
    slot.selected = None;
    WardenError::Remote(format!("{}: {}", what, err))
}

/// Drain a response stream, logging per-item errors.
async fn drain<T, E: std::fmt::Display>(
    stream: impl Stream<Item = std::result::Result<T, E>>,
    context: &str,
) {
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        if let Err(e) = item {
            debug!("{} response error: {}", context, e);
        }
    }
}

impl ImapClient {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(SessionSlot {
                session: None,
                selected: None,
            }),
            idle_started: AtomicBool::new(false),
            idle_stop: Arc::new(AtomicBool::new(false)),
            idle_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ImapConfig {
        &self.config
    }

    /// Make sure the slot has a live session with `folder` selected in the
    /// required mode, connecting and re-selecting as needed.
    async fn prepare<'a>(
        &self,
        slot: &'a mut SessionSlot,
        folder: &str,
        writable: bool,
    ) -> Result<&'a mut ImapSession> {
        if slot.session.is_none() {
            slot.session = Some(connection::connect(&self.config).await?);
            slot.selected = None;
        }

        let needs_select = match &slot.selected {
            Some((current, read_only)) => current != folder || (writable && *read_only),
            None => true,
        };

        if needs_select {
            let session = slot.session.as_mut().expect("session just ensured");
            let select = if writable {
                session.select(folder).await
            } else {
                session.examine(folder).await
            };
            if let Err(e) = select {
                return Err(poison(slot, "folder select failed", e));
            }
            slot.selected = Some((folder.to_string(), !writable));
            debug!(folder, writable, "selected folder");
        }

        Ok(slot.session.as_mut().expect("session just ensured"))
    }

    /// Run a server-side search and return the matching UIDs in ascending
    /// (server-assigned) order.
    pub async fn search_uids(&self, folder: &str, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let query = search::build_search_expression(criteria);
        debug!(folder, query = %query, "IMAP search");

        let mut slot = self.slot.lock().await;
        let result = {
            let session = self.prepare(&mut slot, folder, false).await?;
            session.uid_search(&query).await
        };
        let uids = match result {
            Ok(set) => set,
            Err(e) => return Err(poison(&mut slot, "SEARCH failed", e)),
        };

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Headers-only fetch, batched. Returns a map keyed by UID; messages
    /// whose headers fail to parse are logged and omitted.
    pub async fn fetch_headers(
        &self,
        folder: &str,
        uids: &[u32],
    ) -> Result<HashMap<u32, EmailRecord>> {
        let mut records = HashMap::new();
        if uids.is_empty() {
            return Ok(records);
        }

        let mut slot = self.slot.lock().await;
        for chunk in uids.chunks(HEADER_BATCH_SIZE) {
            let set = fetch::uid_set(chunk);
            let fetched = {
                let session = self.prepare(&mut slot, folder, false).await?;
                match session.uid_fetch(&set, HEADER_FETCH_QUERY).await {
                    Ok(stream) => Ok(fetch::collect_tolerant(stream, "headers").await),
                    Err(e) => Err(e),
                }
            };
            let fetches = match fetched {
                Ok(fetches) => fetches,
                Err(e) => return Err(poison(&mut slot, "header FETCH failed", e)),
            };

            for item in &fetches {
                let Some(uid) = item.uid else { continue };
                let Some(raw) = item.header() else { continue };
                let flags = FlagSet::from_fetch(item);
                match fetch::parse_message(folder, uid, &flags, item.size, item.internal_date(), raw)
                {
                    Ok((record, _)) => {
                        records.insert(uid, record);
                    }
                    Err(e) => warn!(uid, "header parse failed: {}", e),
                }
            }
        }

        Ok(records)
    }

    /// Full-body fetch, batched. Messages over the size cap are rejected
    /// before the body round-trip; per-message failures are isolated and
    /// counted. Results come back in the order `uids` were given.
    pub async fn fetch_full(
        &self,
        folder: &str,
        uids: &[u32],
        batch_size: Option<usize>,
    ) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        if uids.is_empty() {
            return Ok(outcome);
        }
        let batch_size = batch_size.unwrap_or(BODY_BATCH_SIZE).max(1);

        let mut slot = self.slot.lock().await;

        // Round trip 1: sizes, so oversized messages never hit the wire.
        let mut sizes: HashMap<u32, u32> = HashMap::new();
        for chunk in uids.chunks(HEADER_BATCH_SIZE) {
            let set = fetch::uid_set(chunk);
            let fetched = {
                let session = self.prepare(&mut slot, folder, false).await?;
                match session.uid_fetch(&set, "(UID RFC822.SIZE)").await {
                    Ok(stream) => Ok(fetch::collect_tolerant(stream, "sizes").await),
                    Err(e) => Err(e),
                }
            };
            let fetches = match fetched {
                Ok(fetches) => fetches,
                Err(e) => return Err(poison(&mut slot, "size FETCH failed", e)),
            };
            for item in &fetches {
                if let (Some(uid), Some(size)) = (item.uid, item.size) {
                    sizes.insert(uid, size);
                }
            }
        }

        let mut accepted: Vec<u32> = Vec::with_capacity(uids.len());
        for &uid in uids {
            match sizes.get(&uid) {
                Some(&size) if size > MAX_MESSAGE_SIZE => {
                    warn!(uid, size, "message exceeds size cap, skipping");
                    outcome.errors += 1;
                }
                _ => accepted.push(uid),
            }
        }

        // Round trip 2: bodies for everything under the cap.
        let mut parsed: HashMap<u32, FetchedMail> = HashMap::new();
        for chunk in accepted.chunks(batch_size) {
            let set = fetch::uid_set(chunk);
            let fetched = {
                let session = self.prepare(&mut slot, folder, false).await?;
                match session.uid_fetch(&set, BODY_FETCH_QUERY).await {
                    Ok(stream) => Ok(fetch::collect_tolerant(stream, "bodies").await),
                    Err(e) => Err(e),
                }
            };
            let fetches = match fetched {
                Ok(fetches) => fetches,
                Err(e) => return Err(poison(&mut slot, "body FETCH failed", e)),
            };

            for item in &fetches {
                let Some(uid) = item.uid else { continue };
                let Some(raw) = item.body() else {
                    warn!(uid, "fetch returned no body");
                    continue;
                };
                let flags = FlagSet::from_fetch(item);
                match fetch::parse_message(folder, uid, &flags, item.size, item.internal_date(), raw)
                {
                    Ok((record, attachments)) => {
                        parsed.insert(
                            uid,
                            FetchedMail {
                                uid,
                                record,
                                attachments,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(uid, "message parse failed: {}", e);
                        outcome.errors += 1;
                    }
                }
            }
        }

        for uid in accepted {
            match parsed.remove(&uid) {
                Some(mail) => outcome.mails.push(mail),
                None => {
                    warn!(uid, "no parsed result for fetched uid");
                    outcome.errors += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn uid_store(&self, folder: &str, uid: u32, command: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let set = uid.to_string();
        let result = {
            let session = self.prepare(&mut slot, folder, true).await?;
            match session.uid_store(&set, command).await {
                Ok(stream) => {
                    drain(stream, "STORE").await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        result.map_err(|e| poison(&mut slot, "STORE failed", e))
    }

    /// Spawn the keepalive task: a NOOP every 10 seconds whenever the shared
    /// session is up and idle.
    pub fn start_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Skip the beat when another caller holds the session.
                let Ok(mut slot) = client.slot.try_lock() else {
                    continue;
                };
                if let Some(session) = slot.session.as_mut() {
                    if let Err(e) = session.noop().await {
                        debug!("keepalive NOOP failed: {}", e);
                        slot.session = None;
                        slot.selected = None;
                    }
                }
            }
        })
    }

    /// Start IDLE monitoring of `folder` on a dedicated connection. The
    /// callback receives the new-message count of each EXISTS delta and must
    /// not block. Starting a second monitor is a no-op.
    pub fn start_idle_monitoring(self: &Arc<Self>, folder: impl Into<String>, callback: NewMailCallback) {
        if self.idle_started.swap(true, Ordering::SeqCst) {
            warn!("IDLE monitor already running");
            return;
        }
        self.idle_stop.store(false, Ordering::SeqCst);

        let config = self.config.clone();
        let folder = folder.into();
        let stop = Arc::clone(&self.idle_stop);
        let active = Arc::clone(&self.idle_active);
        info!(folder = %folder, "starting IDLE monitoring");
        tokio::spawn(idle::run_idle_loop(config, folder, callback, stop, active));
    }

    /// Request the IDLE loop to stop and clear its callback registration.
    pub fn stop_idle_monitoring(&self) {
        self.idle_stop.store(true, Ordering::SeqCst);
        self.idle_started.store(false, Ordering::SeqCst);
    }

    pub fn is_idle_active(&self) -> bool {
        self.idle_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailOps for ImapClient {
    async fn mark_read(&self, folder: &str, uid: u32, read: bool) -> Result<()> {
        let command = if read {
            "+FLAGS (\\Seen)"
        } else {
            "-FLAGS (\\Seen)"
        };
        self.uid_store(folder, uid, command).await
    }

    async fn set_starred(&self, folder: &str, uid: u32, starred: bool) -> Result<()> {
        let command = if starred {
            "+FLAGS (\\Flagged)"
        } else {
            "-FLAGS (\\Flagged)"
        };
        self.uid_store(folder, uid, command).await
    }

    async fn archive(&self, folder: &str, uid: u32) -> Result<()> {
        if folder == ALL_MAIL {
            debug!(uid, "already in All Mail, archive is a no-op");
            return Ok(());
        }

        let mut slot = self.slot.lock().await;
        let set = uid.to_string();
        let result = {
            let session = self.prepare(&mut slot, folder, true).await?;
            let inner: std::result::Result<(), async_imap::error::Error> = async {
                session.uid_copy(&set, ALL_MAIL).await?;
                let stream = session.uid_store(&set, "+FLAGS.SILENT (\\Deleted)").await?;
                drain(stream, "STORE").await;
                let stream = session.expunge().await?;
                drain(stream, "EXPUNGE").await;
                Ok(())
            }
            .await;
            inner
        };
        result.map_err(|e| poison(&mut slot, "archive failed", e))
    }

    async fn store_label(&self, folder: &str, uid: u32, label: &str, add: bool) -> Result<()> {
        let sign = if add { '+' } else { '-' };
        let command = format!("{}X-GM-LABELS (\"{}\")", sign, label.replace('"', "\\\""));
        self.uid_store(folder, uid, &command).await
    }
}
