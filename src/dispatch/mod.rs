//! Event dispatch and the listener capability context.
//!
//! For each event the dispatcher collects the subscribed modules, builds a
//! fresh context bound to each module's identity, and interprets the
//! module's rule through it. A failing listener is logged and contained;
//! dispatch is sequential so runs stay deterministic.
//!
//! The context is the only surface a listener can cause side effects
//! through. Every mutation resolves the message id to a stored UID, issues
//! the remote operation, then mirrors the change locally, in that order, so
//! a remote failure leaves the store untouched.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::agent::{AgentCall, AgentRequest};
use crate::error::{Result, WardenError};
use crate::imap::{MailOps, ALL_MAIL};
use crate::listeners::{render_template, Action, ListenerConfig, ListenerRegistry, RuleFile};
use crate::store::{FlagUpdate, MailStore};
use crate::types::{EmailEvent, EmailRecord, Notification, Priority};

/// Capability object handed to a listener invocation. Holds the listener's
/// identity plus the four collaborators every side effect funnels through.
pub struct ListenerContext {
    listener_id: String,
    listener_name: String,
    store: Arc<MailStore>,
    mail_ops: Arc<dyn MailOps>,
    agent: Arc<dyn AgentCall>,
    notifications: flume::Sender<Notification>,
}

impl ListenerContext {
    /// Resolve a listener-visible message id to its folder and server UID.
    fn resolve(&self, message_id: &str) -> Result<(String, u32)> {
        let email = self
            .store
            .get_by_message_id(message_id)?
            .ok_or_else(|| WardenError::NotFound(format!("unknown message {}", message_id)))?;
        let uid = email.uid.ok_or_else(|| {
            WardenError::NotFound(format!("message {} has no server UID", message_id))
        })?;
        Ok((email.folder, uid))
    }

    /// Mirror a remote change locally, logging the divergence if the local
    /// write fails after the remote operation already succeeded.
    fn mirror(&self, message_id: &str, update: FlagUpdate) -> Result<()> {
        if let Err(e) = self.store.update_email_flags(message_id, &update) {
            warn!(
                listener = %self.listener_id,
                message_id,
                "local mirror diverged after remote success: {}", e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Emit a notification to the host. Enqueues synchronously; never blocks
    /// on I/O.
    pub fn notify(&self, message: &str, priority: Priority, email_ref: Option<&str>) {
        let notification = Notification {
            listener_id: self.listener_id.clone(),
            listener_name: self.listener_name.clone(),
            priority,
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
            email_ref: email_ref.map(|id| id.to_string()),
        };
        let _ = self.notifications.send(notification);
    }

    /// Move a message to All Mail, remotely and in the mirror. Idempotent
    /// when the message is already archived.
    pub async fn archive_email(&self, message_id: &str) -> Result<()> {
        let (folder, uid) = self.resolve(message_id)?;
        self.mail_ops.archive(&folder, uid).await?;
        self.mirror(
            message_id,
            FlagUpdate {
                folder: Some(ALL_MAIL.to_string()),
                ..Default::default()
            },
        )
    }

    pub async fn star_email(&self, message_id: &str) -> Result<()> {
        self.set_starred(message_id, true).await
    }

    pub async fn unstar_email(&self, message_id: &str) -> Result<()> {
        self.set_starred(message_id, false).await
    }

    async fn set_starred(&self, message_id: &str, starred: bool) -> Result<()> {
        let (folder, uid) = self.resolve(message_id)?;
        self.mail_ops.set_starred(&folder, uid, starred).await?;
        self.mirror(
            message_id,
            FlagUpdate {
                is_starred: Some(starred),
                ..Default::default()
            },
        )
    }

    pub async fn mark_as_read(&self, message_id: &str) -> Result<()> {
        self.set_read(message_id, true).await
    }

    pub async fn mark_as_unread(&self, message_id: &str) -> Result<()> {
        self.set_read(message_id, false).await
    }

    async fn set_read(&self, message_id: &str, read: bool) -> Result<()> {
        let (folder, uid) = self.resolve(message_id)?;
        self.mail_ops.mark_read(&folder, uid, read).await?;
        self.mirror(
            message_id,
            FlagUpdate {
                is_read: Some(read),
                ..Default::default()
            },
        )
    }

    pub async fn add_label(&self, message_id: &str, label: &str) -> Result<()> {
        self.change_label(message_id, label, true).await
    }

    pub async fn remove_label(&self, message_id: &str, label: &str) -> Result<()> {
        self.change_label(message_id, label, false).await
    }

    async fn change_label(&self, message_id: &str, label: &str, add: bool) -> Result<()> {
        let email = self
            .store
            .get_by_message_id(message_id)?
            .ok_or_else(|| WardenError::NotFound(format!("unknown message {}", message_id)))?;
        let uid = email.uid.ok_or_else(|| {
            WardenError::NotFound(format!("message {} has no server UID", message_id))
        })?;

        self.mail_ops
            .store_label(&email.folder, uid, label, add)
            .await?;

        let mut labels = email.labels;
        if add {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        } else {
            labels.retain(|l| l != label);
        }
        self.mirror(
            message_id,
            FlagUpdate {
                labels: Some(labels),
                ..Default::default()
            },
        )
    }

    /// One structured LLM call through the gateway.
    pub async fn call_agent(&self, request: &AgentRequest) -> Result<Value> {
        self.agent.call(request).await
    }
}

/// Fans events out to the subscribed listeners.
pub struct Dispatcher {
    registry: Arc<ListenerRegistry>,
    store: Arc<MailStore>,
    mail_ops: Arc<dyn MailOps>,
    agent: Arc<dyn AgentCall>,
    notification_tx: flume::Sender<Notification>,
}

impl Dispatcher {
    /// Build a dispatcher. The returned receiver is the host's notification
    /// sink.
    pub fn new(
        registry: Arc<ListenerRegistry>,
        store: Arc<MailStore>,
        mail_ops: Arc<dyn MailOps>,
        agent: Arc<dyn AgentCall>,
    ) -> (Arc<Self>, flume::Receiver<Notification>) {
        let (notification_tx, notification_rx) = flume::unbounded();
        let dispatcher = Arc::new(Self {
            registry,
            store,
            mail_ops,
            agent,
            notification_tx,
        });
        (dispatcher, notification_rx)
    }

    pub(crate) fn context_for(&self, config: &ListenerConfig) -> ListenerContext {
        ListenerContext {
            listener_id: config.id.clone(),
            listener_name: config.name.clone(),
            store: Arc::clone(&self.store),
            mail_ops: Arc::clone(&self.mail_ops),
            agent: Arc::clone(&self.agent),
            notifications: self.notification_tx.clone(),
        }
    }

    /// Invoke every listener subscribed to the event's kind. Listener
    /// failures are logged with the listener id and never propagate; the
    /// dispatcher itself does not fail.
    pub async fn check_event(&self, event: &EmailEvent) {
        let modules = self.registry.modules_for(event.kind());
        if modules.is_empty() {
            return;
        }
        debug!(kind = %event.kind(), count = modules.len(), "dispatching event");

        for module in modules {
            let context = self.context_for(&module.config);
            if let Err(e) = run_rule(&module.rule, event, &context).await {
                error!(listener = %module.config.id, "listener failed: {}", e);
            }
        }
    }
}

fn action_target<'a>(email: Option<&'a EmailRecord>) -> Result<&'a str> {
    email
        .map(|e| e.message_id.as_str())
        .ok_or_else(|| WardenError::Listener("action requires an email payload".to_string()))
}

/// Interpret one rule against one event. This is the listener's handler:
/// conditions first, then the optional classification step, then the
/// actions.
async fn run_rule(rule: &RuleFile, event: &EmailEvent, context: &ListenerContext) -> Result<()> {
    if !rule.matches(event) {
        return Ok(());
    }
    let email = event.email();

    let mut agent_output: Option<Value> = None;
    if let Some(step) = &rule.agent {
        let prompt = render_template(&step.prompt, email, None);
        let output = context
            .call_agent(&AgentRequest {
                prompt,
                schema: step.schema.clone(),
                model: step.model,
            })
            .await?;

        if let Some(gate) = &step.require {
            let passed = output.get(gate).and_then(Value::as_bool).unwrap_or(false);
            if !passed {
                debug!(listener = %rule.id, gate = %gate, "classification gate not met");
                return Ok(());
            }
        }
        agent_output = Some(output);
    }

    for action in &rule.actions {
        match action {
            Action::Star => context.star_email(action_target(email)?).await?,
            Action::Unstar => context.unstar_email(action_target(email)?).await?,
            Action::MarkRead => context.mark_as_read(action_target(email)?).await?,
            Action::MarkUnread => context.mark_as_unread(action_target(email)?).await?,
            Action::Archive => context.archive_email(action_target(email)?).await?,
            Action::AddLabel { label } => {
                context.add_label(action_target(email)?, label).await?
            }
            Action::RemoveLabel { label } => {
                context.remove_label(action_target(email)?, label).await?
            }
            Action::Notify { message, priority } => {
                let rendered = render_template(message, email, agent_output.as_ref());
                context.notify(&rendered, *priority, email.map(|e| e.message_id.as_str()));
            }
        }
    }

    Ok(())
}
