//! mailwarden: event-driven email automation engine.
//!
//! The engine mirrors a remote IMAP mailbox into SQLite, watches for new
//! mail with IDLE, and runs declarative listener rules against every
//! observed message through a capability context that keeps the mirror and
//! the remote mailbox coherent.
//!
//! ## Module Organization
//!
//! - `store`: the SQLite mailbox mirror with full-text search
//! - `imap`: connection lifecycle, search, batched fetch, mutations, IDLE
//! - `sync`: incremental and IDLE-driven synchronization
//! - `listeners`: rule-file discovery, validation, hot reload
//! - `dispatch`: per-event fan-out and the listener context
//! - `agent`: the structured-output LLM gateway
//! - `config`: environment configuration
//! - `types`: records, events, notifications

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod imap;
pub mod listeners;
pub mod store;
pub mod sync;
pub mod types;

pub use agent::{AgentCall, AgentGateway, AgentModel, AgentRequest};
pub use config::Config;
pub use dispatch::{Dispatcher, ListenerContext};
pub use error::{Result, WardenError};
pub use imap::{ImapClient, ImapConfig, MailOps, ALL_MAIL};
pub use listeners::{ListenerConfig, ListenerRegistry};
pub use store::{FlagUpdate, MailStore, SearchCriteria, SyncKind};
pub use sync::{SyncOptions, SyncReport, SyncService};
pub use types::{
    AttachmentMeta, EmailEvent, EmailRecord, EventKind, Notification, Priority, Recipient,
    RecipientKind,
};
