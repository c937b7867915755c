use std::time::Duration;

use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::error::{Result, WardenError};

// An IMAP session is generic over the stream type; here it's TLS-encrypted
// TCP. The alias saves spelling that out at every call site.
pub type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters for the remote mailbox. TLS is always on.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ImapConfig {
    /// Detect Gmail by hostname. Servers also advertise X-GM-EXT-1 in
    /// capabilities, but the host check is simpler and reliable.
    pub fn is_gmail(&self) -> bool {
        self.host.contains("gmail.com") || self.host.contains("googlemail.com")
    }
}

/// Open a TLS connection and log in. Connect and auth each run under their
/// own 30 second timeout; auth failures are terminal and come back as
/// `WardenError::Auth`.
pub async fn connect(config: &ImapConfig) -> Result<ImapSession> {
    info!(host = %config.host, port = config.port, "connecting to IMAP server");

    let tcp = timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| WardenError::Connection("IMAP connect timed out".to_string()))?
    .map_err(|e| WardenError::Connection(format!("TCP connection failed: {}", e)))?;

    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = timeout(CONNECT_TIMEOUT, tls.connect(&config.host, tcp))
        .await
        .map_err(|_| WardenError::Connection("TLS handshake timed out".to_string()))?
        .map_err(|e| WardenError::Connection(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    let session = timeout(AUTH_TIMEOUT, client.login(&config.username, &config.password))
        .await
        .map_err(|_| WardenError::Connection("IMAP login timed out".to_string()))?
        .map_err(|(e, _)| WardenError::Auth(format!("login failed: {}", e)))?;

    info!(host = %config.host, "IMAP session established");
    Ok(session)
}
