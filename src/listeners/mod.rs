//! Listener modules: discovery, validation, and hot reload.
//!
//! A listener is a TOML rule file in the configured directory (see
//! [`rules`]). The registry owns the active set and swaps it atomically on
//! every reload; a directory watcher drives reloads while the engine runs.

mod registry;
mod rules;

pub use registry::{ListenerModule, ListenerRegistry, RegistryStats};
pub use rules::{render_template, Action, AgentStep, ListenerConfig, MatchRules, RuleFile};
