//! Engine entry point: wires the store, IMAP client, agent gateway, listener
//! registry, dispatcher, and sync service together, then runs IDLE
//! monitoring until shutdown.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mailwarden::{
    AgentGateway, Config, Dispatcher, ImapClient, ImapConfig, ListenerRegistry, MailStore,
    Result, SyncService,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?;
    info!(mailbox = %config.email_address, "starting mailwarden");

    let store = Arc::new(MailStore::open(&config.database_path)?);
    info!(path = %config.database_path.display(), "mail store ready");

    let imap = Arc::new(ImapClient::new(ImapConfig {
        host: config.imap_host.clone(),
        port: config.imap_port,
        username: config.email_address.clone(),
        password: config.email_password.clone(),
    }));
    imap.start_keepalive();

    if config.anthropic_api_key.is_none() {
        warn!("ANTHROPIC_API_KEY is not set; listener agent calls will fail");
    }
    let agent = Arc::new(AgentGateway::new(config.anthropic_api_key.clone()));

    let (registry, registry_changes) = ListenerRegistry::new(&config.listeners_dir);
    let active = registry.load_all()?;
    info!(active, dir = %config.listeners_dir.display(), "listeners loaded");
    registry.start_watching()?;

    // Host sink for hot-reload broadcasts.
    tokio::spawn(async move {
        while let Ok(configs) = registry_changes.recv_async().await {
            let ids: Vec<&str> = configs.iter().map(|c| c.id.as_str()).collect();
            info!(listeners = ?ids, "listener set updated");
        }
    });

    let (dispatcher, notifications) = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        imap.clone() as Arc<dyn mailwarden::MailOps>,
        agent,
    );

    // Host sink for listener notifications.
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv_async().await {
            info!(
                listener = %notification.listener_id,
                priority = ?notification.priority,
                "{}", notification.message
            );
        }
    });

    let sync = Arc::new(SyncService::new(
        Arc::clone(&store),
        Arc::clone(&imap),
        dispatcher,
    ));

    // Catch up before entering IDLE.
    match sync.sync_new().await {
        Ok(report) => info!(
            synced = report.synced,
            skipped = report.skipped,
            errors = report.errors,
            "initial sync complete"
        ),
        Err(e) => error!("initial sync failed: {}", e),
    }

    // The IDLE callback must not block: it hands the count to a channel and
    // the sync task does the work.
    let (burst_tx, burst_rx) = flume::unbounded::<u32>();
    {
        let sync = Arc::clone(&sync);
        tokio::spawn(async move {
            while let Ok(count) = burst_rx.recv_async().await {
                match sync.handle_idle_event(count).await {
                    Ok(report) => info!(
                        count,
                        synced = report.synced,
                        skipped = report.skipped,
                        "absorbed IDLE burst"
                    ),
                    Err(e) => error!("IDLE sync failed: {}", e),
                }
            }
        });
    }
    imap.start_idle_monitoring(
        "INBOX",
        Arc::new(move |count| {
            let _ = burst_tx.send(count);
        }),
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    imap.stop_idle_monitoring();
    info!("mailwarden stopped");

    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mailwarden=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
