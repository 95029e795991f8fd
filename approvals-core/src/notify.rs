//! Approval notifications.
//!
//! Publishing is fire-and-forget: [`NotificationPublisher::publish`] has no
//! error channel, and implementations log their own delivery failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

const CATEGORY: &str = "ap_approval";
const RESOURCE_TYPE: &str = "invoice";

/// Approval event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    InvoiceSubmitted,
    InvoiceApprovalRequired,
    InvoiceApproved,
    InvoiceRejected,
    InvoiceRecalled,
    InvoiceDelegated,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::InvoiceSubmitted => "invoice_submitted",
            NotificationType::InvoiceApprovalRequired => "invoice_approval_required",
            NotificationType::InvoiceApproved => "invoice_approved",
            NotificationType::InvoiceRejected => "invoice_rejected",
            NotificationType::InvoiceRecalled => "invoice_recalled",
            NotificationType::InvoiceDelegated => "invoice_delegated",
        }
    }

    /// Whether recipients are expected to take an approval action.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            NotificationType::InvoiceSubmitted
                | NotificationType::InvoiceApprovalRequired
                | NotificationType::InvoiceDelegated
        )
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

/// Event handed to a publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub event_type: NotificationType,
    pub entity_id: String,
    pub actor_id: String,
    pub recipients: Vec<String>,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub is_actionable: bool,
    pub severity: Severity,
    pub category: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        event_type: NotificationType,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
        invoice_id: Uuid,
    ) -> Self {
        let severity = match event_type {
            NotificationType::InvoiceRejected | NotificationType::InvoiceRecalled => {
                Severity::Warning
            }
            _ => Severity::Info,
        };
        Self {
            id: Uuid::new_v4(),
            event_type,
            entity_id: entity_id.into(),
            actor_id: actor_id.into(),
            recipients: Vec::new(),
            resource_type: RESOURCE_TYPE.to_string(),
            resource_id: invoice_id,
            is_actionable: event_type.is_actionable(),
            severity,
            category: CATEGORY.to_string(),
            payload: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Add recipients, skipping blanks and duplicates.
    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for r in recipients {
            let r = r.into();
            if !r.trim().is_empty() && !self.recipients.contains(&r) {
                self.recipients.push(r);
            }
        }
        self
    }

    pub fn with_payload(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Routing subject, `notifications.ap.<event_type>`.
    pub fn subject(&self) -> String {
        format!("notifications.ap.{}", self.event_type)
    }
}

/// Sink for approval events.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, event: NotificationEvent);
}

/// Publish `event` unless it has no recipients.
pub async fn dispatch(publisher: &dyn NotificationPublisher, event: NotificationEvent) {
    if event.recipients.is_empty() {
        tracing::debug!(
            event_type = %event.event_type,
            invoice_id = %event.resource_id,
            "Notification dropped: no recipients"
        );
        return;
    }
    publisher.publish(event).await;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl NotificationPublisher for NoopPublisher {
    async fn publish(&self, _event: NotificationEvent) {}
}

/// Emits each event as a JSON `info` log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl NotificationPublisher for TracingPublisher {
    async fn publish(&self, event: NotificationEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(
                subject = %event.subject(),
                recipients = event.recipients.len(),
                event = %json,
                "Notification published"
            ),
            Err(e) => tracing::warn!(
                subject = %event.subject(),
                error = %e,
                "Failed to serialize notification"
            ),
        }
    }
}

/// Forwards events into an unbounded `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelPublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationPublisher for ChannelPublisher {
    async fn publish(&self, event: NotificationEvent) {
        let subject = event.subject();
        if self.tx.send(event).is_err() {
            tracing::warn!(%subject, "Notification receiver closed; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_defaults() {
        let invoice = Uuid::new_v4();
        let event = NotificationEvent::new(NotificationType::InvoiceRejected, "ent", "bob", invoice)
            .with_recipients(["alice", "", "alice"])
            .with_payload("reason", "wrong PO");

        assert_eq!(event.recipients, vec!["alice".to_string()]);
        assert_eq!(event.subject(), "notifications.ap.invoice_rejected");
        assert_eq!(event.resource_type, "invoice");
        assert_eq!(event.category, "ap_approval");
        assert_eq!(event.severity, Severity::Warning);
        assert!(!event.is_actionable);
        assert_eq!(event.payload["reason"], serde_json::json!("wrong PO"));
    }

    #[test]
    fn test_event_serializes_snake_case_type() {
        let event =
            NotificationEvent::new(NotificationType::InvoiceApprovalRequired, "e", "a", Uuid::nil());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "invoice_approval_required");
        assert_eq!(json["severity"], "info");
        assert_eq!(json["is_actionable"], true);
    }

    #[tokio::test]
    async fn test_dispatch_drops_without_recipients() {
        let (publisher, mut rx) = ChannelPublisher::channel();
        let event = NotificationEvent::new(NotificationType::InvoiceApproved, "e", "a", Uuid::nil());
        dispatch(&publisher, event).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_publisher_forwards() {
        let (publisher, mut rx) = ChannelPublisher::channel();
        let event = NotificationEvent::new(NotificationType::InvoiceApproved, "e", "a", Uuid::nil())
            .with_recipients(["alice"]);
        dispatch(&publisher, event.clone()).await;
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_channel_publisher_tolerates_closed_receiver() {
        let (publisher, rx) = ChannelPublisher::channel();
        drop(rx);
        let event = NotificationEvent::new(NotificationType::InvoiceApproved, "e", "a", Uuid::nil())
            .with_recipients(["alice"]);
        dispatch(&publisher, event).await;
    }
}
