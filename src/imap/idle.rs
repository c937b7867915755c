//! IMAP IDLE monitoring.
//!
//! The monitor runs on its own connection so long IDLE waits never contend
//! with the shared operations session. State machine: Disconnected →
//! Connecting → Selected → Idling; any error drops back to Disconnected and
//! reconnects into the same folder after a short backoff. IDLE is renewed
//! well before the common 29-minute NAT timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::imap::connection::{self, ImapConfig};

/// Re-issue IDLE at this interval; must stay under server/NAT timeouts.
pub const IDLE_RENEWAL: Duration = Duration::from_secs(4 * 60);

/// Pause before reconnecting after a dropped IDLE connection.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Callback invoked with the number of new messages seen in one EXISTS
/// delta. Must not block; long work belongs on a separate task.
pub type NewMailCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Long-lived IDLE loop. Returns when `stop` is set; connection errors are
/// absorbed with a backoff-and-reconnect so the registered callback survives
/// server drops.
pub(crate) async fn run_idle_loop(
    config: ImapConfig,
    folder: String,
    callback: NewMailCallback,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
) {
    active.store(true, Ordering::SeqCst);
    while !stop.load(Ordering::SeqCst) {
        match idle_session(&config, &folder, &callback, &stop).await {
            Ok(()) => break,
            Err(e) => {
                warn!(folder = %folder, "IDLE connection lost: {}; reconnecting in {:?}", e, RECONNECT_BACKOFF);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
    active.store(false, Ordering::SeqCst);
    info!(folder = %folder, "IDLE monitoring stopped");
}

/// One connection's worth of IDLE. Returns `Ok(())` only on a requested stop.
async fn idle_session(
    config: &ImapConfig,
    folder: &str,
    callback: &NewMailCallback,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    debug!(folder, "IDLE connecting");
    let mut session = connection::connect(config).await?;

    let mailbox = session
        .select(folder)
        .await
        .map_err(|e| WardenError::Remote(format!("SELECT {} failed: {}", folder, e)))?;
    let mut known_exists = mailbox.exists;
    info!(folder, exists = known_exists, "entering IDLE");

    loop {
        if stop.load(Ordering::SeqCst) {
            let _ = session.logout().await;
            return Ok(());
        }

        let mut idle = session.idle();
        idle.init()
            .await
            .map_err(|e| WardenError::Remote(format!("IDLE init failed: {}", e)))?;

        // The interrupt handle must stay alive for the duration of the wait;
        // dropping it cancels the IDLE immediately.
        let (idle_wait, _interrupt) = idle.wait_with_timeout(IDLE_RENEWAL);
        let outcome = idle_wait
            .await
            .map_err(|e| WardenError::Remote(format!("IDLE wait failed: {}", e)))?;

        session = idle
            .done()
            .await
            .map_err(|e| WardenError::Remote(format!("IDLE done failed: {}", e)))?;

        match outcome {
            IdleResponse::Timeout => {
                debug!(folder, "renewing IDLE");
            }
            IdleResponse::ManualInterrupt => {
                let _ = session.logout().await;
                return Ok(());
            }
            IdleResponse::NewData(data) => match data.parsed() {
                Response::MailboxData(MailboxDatum::Exists(count)) => {
                    if *count > known_exists {
                        let fresh = *count - known_exists;
                        known_exists = *count;
                        info!(folder, fresh, "new mail during IDLE");
                        callback(fresh);
                    } else {
                        known_exists = *count;
                    }
                }
                Response::Expunge(_) => {
                    known_exists = known_exists.saturating_sub(1);
                    debug!(folder, exists = known_exists, "expunge during IDLE");
                }
                other => {
                    debug!(folder, "unhandled IDLE update: {:?}", other);
                }
            },
        }
    }
}
