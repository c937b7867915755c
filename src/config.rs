//! Environment-driven configuration.
//!
//! Everything the engine needs comes from the process environment: mailbox
//! credentials, IMAP endpoint, the Anthropic API key for agent calls, and the
//! paths for the local database and the listener rule directory.

use std::path::PathBuf;

use crate::error::{Result, WardenError};

const DEFAULT_IMAP_HOST: &str = "imap.gmail.com";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_DATABASE_PATH: &str = "mailwarden.db";
const DEFAULT_LISTENERS_DIR: &str = "listeners";

/// Runtime configuration for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mailbox address, also used as the IMAP login.
    pub email_address: String,

    /// App password for the mailbox.
    pub email_password: String,

    /// IMAP server hostname. TLS is always on.
    pub imap_host: String,

    /// IMAP server port.
    pub imap_port: u16,

    /// API key for the agent gateway. Optional; `call_agent` fails at call
    /// time when absent.
    pub anthropic_api_key: Option<String>,

    /// Path of the SQLite mirror.
    pub database_path: PathBuf,

    /// Directory scanned and watched for listener rule files.
    pub listeners_dir: PathBuf,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function. Factored out
    /// so tests don't have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let email_address = lookup("EMAIL_ADDRESS")
            .or_else(|| lookup("EMAIL_USER"))
            .ok_or_else(|| {
                WardenError::Config("EMAIL_ADDRESS (or EMAIL_USER) is required".to_string())
            })?;

        let email_password = lookup("EMAIL_APP_PASSWORD")
            .or_else(|| lookup("EMAIL_PASS"))
            .ok_or_else(|| {
                WardenError::Config("EMAIL_APP_PASSWORD (or EMAIL_PASS) is required".to_string())
            })?;

        let imap_host = lookup("IMAP_HOST").unwrap_or_else(|| DEFAULT_IMAP_HOST.to_string());

        let imap_port = match lookup("IMAP_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| WardenError::Config(format!("invalid IMAP_PORT: {}", raw)))?,
            None => DEFAULT_IMAP_PORT,
        };

        let database_path = lookup("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

        let listeners_dir = lookup("LISTENERS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LISTENERS_DIR));

        Ok(Self {
            email_address,
            email_password,
            imap_host,
            imap_port,
            anthropic_api_key: lookup("ANTHROPIC_API_KEY"),
            database_path,
            listeners_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_fill_in_optional_fields() {
        let mut env = HashMap::new();
        env.insert("EMAIL_ADDRESS", "me@example.com");
        env.insert("EMAIL_APP_PASSWORD", "hunter2");

        let config = Config::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.imap_host, "imap.gmail.com");
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.database_path, PathBuf::from("mailwarden.db"));
        assert!(config.anthropic_api_key.is_none());
    }

    #[test]
    fn credential_synonyms_are_accepted() {
        let mut env = HashMap::new();
        env.insert("EMAIL_USER", "me@example.com");
        env.insert("EMAIL_PASS", "hunter2");

        let config = Config::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.email_address, "me@example.com");
        assert_eq!(config.email_password, "hunter2");
    }

    #[test]
    fn missing_credentials_fail() {
        let env: HashMap<&str, &str> = HashMap::new();
        let err = Config::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut env = HashMap::new();
        env.insert("EMAIL_ADDRESS", "me@example.com");
        env.insert("EMAIL_APP_PASSWORD", "hunter2");
        env.insert("IMAP_PORT", "not-a-port");

        let err = Config::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }
}
