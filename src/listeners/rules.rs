//! The declarative listener rule format.
//!
//! A listener is one TOML file: an identity block, a `[match]` table of
//! conditions, an optional `[agent]` classification step, and a list of
//! `[[actions]]`. The parsed file is the module's handler: the dispatcher
//! interprets it against each event through the listener context.
//!
//! ```toml
//! id = "auto_archive_newsletters"
//! name = "Auto-archive newsletters"
//! enabled = true
//! event = "email_received"
//!
//! [match]
//! from = ["news@noreply.site"]
//!
//! [[actions]]
//! kind = "archive"
//!
//! [[actions]]
//! kind = "mark_read"
//!
//! [[actions]]
//! kind = "notify"
//! message = "Auto-archived newsletter: {subject}"
//! priority = "low"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentModel;
use crate::error::{Result, WardenError};
use crate::types::{EmailEvent, EmailRecord, EventKind, Priority};

fn default_true() -> bool {
    true
}

/// A parsed listener rule file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub event: EventKind,
    #[serde(rename = "match", default)]
    pub conditions: MatchRules,
    pub agent: Option<AgentStep>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Conditions a payload must satisfy before the actions run. All present
/// condition groups must match; within a group, arrays are any-of
/// substrings, compared case-insensitively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchRules {
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject_contains: Vec<String>,
    #[serde(default)]
    pub body_contains: Vec<String>,
    pub has_attachments: Option<bool>,
    /// For labeled events: the label that must have been applied.
    pub label: Option<String>,
}

/// Optional classification step. The prompt is rendered with the usual
/// placeholders, sent through the agent gateway with `schema` enforced, and
/// `require` names a boolean output property that gates the actions.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentStep {
    pub prompt: String,
    #[serde(default)]
    pub model: AgentModel,
    pub schema: Value,
    pub require: Option<String>,
}

/// One listener action, executed through the context.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Star,
    Unstar,
    MarkRead,
    MarkUnread,
    Archive,
    AddLabel { label: String },
    RemoveLabel { label: String },
    Notify {
        message: String,
        #[serde(default)]
        priority: Priority,
    },
}

/// The identity surfaced to the host: everything but the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub event: EventKind,
}

impl RuleFile {
    pub fn parse(source: &str) -> Result<Self> {
        let rule: RuleFile = toml::from_str(source)?;
        if rule.id.trim().is_empty() {
            return Err(WardenError::Listener("listener id must not be empty".to_string()));
        }
        if rule.actions.is_empty() && rule.agent.is_none() {
            return Err(WardenError::Listener(format!(
                "listener '{}' has no actions",
                rule.id
            )));
        }
        Ok(rule)
    }

    pub fn config(&self) -> ListenerConfig {
        ListenerConfig {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            event: self.event,
        }
    }

    /// Whether this rule's conditions accept the event payload.
    pub fn matches(&self, event: &EmailEvent) -> bool {
        self.conditions.matches(event.email(), event.label())
    }
}

fn any_substring(needles: &[String], haystack: &str) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_lowercase()))
}

impl MatchRules {
    fn matches(&self, email: Option<&EmailRecord>, event_label: Option<&str>) -> bool {
        if let Some(expected) = &self.label {
            match event_label {
                Some(label) if label.eq_ignore_ascii_case(expected) => {}
                _ => return false,
            }
        }

        let Some(email) = email else {
            // Payloads without an email (scheduled ticks) only match rules
            // that put no conditions on the message.
            return self.from.is_empty()
                && self.to.is_empty()
                && self.subject_contains.is_empty()
                && self.body_contains.is_empty()
                && self.has_attachments.is_none();
        };

        if !self.from.is_empty() && !any_substring(&self.from, &email.from_address) {
            return false;
        }

        if !self.to.is_empty() {
            let joined = email.to_addresses.join(", ");
            if !any_substring(&self.to, &joined) {
                return false;
            }
        }

        if !self.subject_contains.is_empty() {
            let subject = email.subject.as_deref().unwrap_or("");
            if !any_substring(&self.subject_contains, subject) {
                return false;
            }
        }

        if !self.body_contains.is_empty() {
            let body = email.body_text.as_deref().unwrap_or("");
            if !any_substring(&self.body_contains, body) {
                return false;
            }
        }

        if let Some(wanted) = self.has_attachments {
            if (email.attachment_count > 0) != wanted {
                return false;
            }
        }

        true
    }
}

fn value_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render `{subject}`-style placeholders in notification messages and agent
/// prompts. `{agent.field}` pulls from the classification output.
pub fn render_template(
    template: &str,
    email: Option<&EmailRecord>,
    agent_output: Option<&Value>,
) -> String {
    let mut out = template.to_string();

    if let Some(email) = email {
        out = out
            .replace("{subject}", email.subject.as_deref().unwrap_or(""))
            .replace("{from}", &email.from_address)
            .replace("{from_name}", email.from_name.as_deref().unwrap_or(""))
            .replace("{snippet}", email.snippet.as_deref().unwrap_or(""))
            .replace("{folder}", &email.folder)
            .replace("{message_id}", &email.message_id);
    }

    if let Some(Value::Object(fields)) = agent_output {
        for (key, value) in fields {
            out = out.replace(&format!("{{agent.{}}}", key), &value_display(value));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NEWSLETTER_RULE: &str = r#"
id = "auto_archive_newsletters"
name = "Auto-archive newsletters"
description = "Archive anything from the newsletter sender"
enabled = true
event = "email_received"

[match]
from = ["news@noreply.site"]

[[actions]]
kind = "archive"

[[actions]]
kind = "mark_read"

[[actions]]
kind = "notify"
message = "Auto-archived newsletter: {subject}"
priority = "low"
"#;

    const URGENT_RULE: &str = r#"
id = "boss_urgent_watcher"
name = "Boss urgent watcher"
event = "email_received"

[match]
from = ["boss@company.com"]

[agent]
prompt = "Decide whether this email is urgent. Subject: {subject}. Body: {snippet}"
model = "haiku"
require = "isUrgent"

[agent.schema]
type = "object"
required = ["isUrgent", "priority", "reason", "requiresImmediateAction"]

[agent.schema.properties.isUrgent]
type = "boolean"

[agent.schema.properties.priority]
type = "string"

[agent.schema.properties.reason]
type = "string"

[agent.schema.properties.requiresImmediateAction]
type = "boolean"

[[actions]]
kind = "star"

[[actions]]
kind = "notify"
message = "Urgent from boss: {agent.reason}"
priority = "high"
"#;

    fn email(from: &str, subject: &str) -> EmailRecord {
        EmailRecord {
            message_id: "<m@x>".to_string(),
            from_address: from.to_string(),
            subject: Some(subject.to_string()),
            folder: "INBOX".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_newsletter_rule() {
        let rule = RuleFile::parse(NEWSLETTER_RULE).unwrap();
        assert_eq!(rule.id, "auto_archive_newsletters");
        assert!(rule.enabled);
        assert_eq!(rule.event, EventKind::EmailReceived);
        assert_eq!(rule.actions.len(), 3);
        assert!(matches!(rule.actions[0], Action::Archive));
        match &rule.actions[2] {
            Action::Notify { message, priority } => {
                assert!(message.contains("{subject}"));
                assert_eq!(*priority, Priority::Low);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn parses_agent_backed_rule() {
        let rule = RuleFile::parse(URGENT_RULE).unwrap();
        let agent = rule.agent.as_ref().unwrap();
        assert_eq!(agent.model, AgentModel::Haiku);
        assert_eq!(agent.require.as_deref(), Some("isUrgent"));
        let required = agent.schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 4);
    }

    #[test]
    fn enabled_defaults_to_true() {
        let rule = RuleFile::parse(
            "id = \"r\"\nname = \"r\"\nevent = \"email_received\"\n\n[[actions]]\nkind = \"star\"\n",
        )
        .unwrap();
        assert!(rule.enabled);
    }

    #[test]
    fn rule_without_actions_is_rejected() {
        let err = RuleFile::parse("id = \"r\"\nname = \"r\"\nevent = \"email_received\"\n")
            .unwrap_err();
        assert!(matches!(err, WardenError::Listener(_)));
    }

    #[test]
    fn from_condition_is_case_insensitive_substring() {
        let rule = RuleFile::parse(NEWSLETTER_RULE).unwrap();
        let matching = EmailEvent::EmailReceived {
            email: email("News@NoReply.Site", "Weekly"),
        };
        let other = EmailEvent::EmailReceived {
            email: email("boss@company.com", "Weekly"),
        };
        assert!(rule.matches(&matching));
        assert!(!rule.matches(&other));
    }

    #[test]
    fn label_condition_gates_labeled_events() {
        let rule = RuleFile::parse(
            "id = \"r\"\nname = \"r\"\nevent = \"email_labeled\"\n\n[match]\nlabel = \"work\"\n\n[[actions]]\nkind = \"star\"\n",
        )
        .unwrap();
        let matching = EmailEvent::EmailLabeled {
            email: email("a@b.c", "s"),
            label: "Work".to_string(),
        };
        let other = EmailEvent::EmailLabeled {
            email: email("a@b.c", "s"),
            label: "personal".to_string(),
        };
        assert!(rule.matches(&matching));
        assert!(!rule.matches(&other));
    }

    #[test]
    fn attachment_condition_checks_count() {
        let rule = RuleFile::parse(
            "id = \"r\"\nname = \"r\"\nevent = \"email_received\"\n\n[match]\nhas_attachments = true\n\n[[actions]]\nkind = \"star\"\n",
        )
        .unwrap();
        let mut with = email("a@b.c", "s");
        with.attachment_count = 2;
        assert!(rule.matches(&EmailEvent::EmailReceived { email: with }));
        assert!(!rule.matches(&EmailEvent::EmailReceived {
            email: email("a@b.c", "s")
        }));
    }

    #[test]
    fn templates_render_email_and_agent_fields() {
        let mail = email("boss@company.com", "Outage");
        let output = json!({ "reason": "production outage", "isUrgent": true });
        let rendered = render_template(
            "Urgent from {from}: {agent.reason} (urgent={agent.isUrgent}) re {subject}",
            Some(&mail),
            Some(&output),
        );
        assert_eq!(
            rendered,
            "Urgent from boss@company.com: production outage (urgent=true) re Outage"
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let rendered = render_template("{agent.missing} stays", None, Some(&json!({})));
        assert_eq!(rendered, "{agent.missing} stays");
    }
}
