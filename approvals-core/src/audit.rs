//! Approval audit ledger.
//!
//! Every workflow action appends one [`AuditEntry`]. Entries are never
//! updated or deleted, and the ledger never fails the operation that
//! produced them: [`AuditLedger::record`] logs a failed append and returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApprovalError, Result};
use crate::invoice::InvoiceStatus;
use crate::store::AuditStore;

// ---------------------------------------------------------------------------
// AuditAction
// ---------------------------------------------------------------------------

/// Kind of workflow action recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submitted,
    Approved,
    Rejected,
    Recalled,
    Delegated,
    Reassigned,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Submitted => "submitted",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::Recalled => "recalled",
            AuditAction::Delegated => "delegated",
            AuditAction::Reassigned => "reassigned",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = ApprovalError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(AuditAction::Submitted),
            "approved" => Ok(AuditAction::Approved),
            "rejected" => Ok(AuditAction::Rejected),
            "recalled" => Ok(AuditAction::Recalled),
            "delegated" => Ok(AuditAction::Delegated),
            "reassigned" => Ok(AuditAction::Reassigned),
            other => Err(ApprovalError::invalid_input(
                "action",
                format!("unknown audit action '{other}'"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

/// A single append-only fact about a workflow action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub invoice_id: Uuid,
    /// Absent only for actions taken before a workflow exists.
    pub workflow_id: Option<Uuid>,
    /// Absent for workflow-wide actions such as recall.
    pub step_id: Option<Uuid>,
    pub entity_id: String,
    pub action: AuditAction,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
    /// Invoice status before the action.
    pub status_before: Option<InvoiceStatus>,
    /// Invoice status after the action.
    pub status_after: Option<InvoiceStatus>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        invoice_id: Uuid,
        entity_id: impl Into<String>,
        action: AuditAction,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            workflow_id: None,
            step_id: None,
            entity_id: entity_id.into(),
            action,
            performed_by: performed_by.into(),
            performed_at: Utc::now(),
            status_before: None,
            status_after: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn for_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn for_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_statuses(mut self, before: InvoiceStatus, after: InvoiceStatus) -> Self {
        self.status_before = Some(before);
        self.status_after = Some(after);
        self
    }

    /// Attach a metadata value. `None`-like inputs are stored as JSON null.
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Metadata value as a string, if present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// AuditLedger
// ---------------------------------------------------------------------------

/// Front end over an [`AuditStore`] used by the router.
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append `entry`. Failures are logged and swallowed.
    pub async fn record(&self, entry: AuditEntry) {
        let action = entry.action;
        let invoice_id = entry.invoice_id;
        match self.store.append_audit(entry).await {
            Ok(()) => {
                tracing::debug!(%invoice_id, %action, "Audit entry appended");
            }
            Err(e) => {
                tracing::warn!(
                    %invoice_id,
                    %action,
                    error = %e,
                    "Failed to append audit entry; continuing"
                );
            }
        }
    }

    /// Full trail for an invoice across all of its workflows, oldest first.
    pub async fn history_for_invoice(&self, invoice_id: Uuid, entity_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.audit_for_invoice(invoice_id, entity_id).await
    }

    /// Trail for a single workflow, oldest first.
    pub async fn history_for_workflow(&self, workflow_id: Uuid, entity_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.audit_for_workflow(workflow_id, entity_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl AuditStore for RecordingStore {
        async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        async fn audit_for_invoice(&self, invoice_id: Uuid, _entity_id: &str) -> Result<Vec<AuditEntry>> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.invoice_id == invoice_id)
                .cloned()
                .collect())
        }

        async fn audit_for_workflow(&self, workflow_id: Uuid, _entity_id: &str) -> Result<Vec<AuditEntry>> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.workflow_id == Some(workflow_id))
                .cloned()
                .collect())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl AuditStore for BrokenStore {
        async fn append_audit(&self, _entry: AuditEntry) -> Result<()> {
            Err(StoreError::Poisoned.into())
        }

        async fn audit_for_invoice(&self, _invoice_id: Uuid, _entity_id: &str) -> Result<Vec<AuditEntry>> {
            Err(StoreError::Poisoned.into())
        }

        async fn audit_for_workflow(&self, _workflow_id: Uuid, _entity_id: &str) -> Result<Vec<AuditEntry>> {
            Err(StoreError::Poisoned.into())
        }
    }

    #[test]
    fn test_action_roundtrip() {
        for action in [
            AuditAction::Submitted,
            AuditAction::Approved,
            AuditAction::Rejected,
            AuditAction::Recalled,
            AuditAction::Delegated,
            AuditAction::Reassigned,
        ] {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
        }
        assert!("edited".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_entry_builder() {
        let invoice = Uuid::new_v4();
        let wf = Uuid::new_v4();
        let entry = AuditEntry::new(invoice, "ent", AuditAction::Rejected, "bob")
            .for_workflow(wf)
            .with_statuses(InvoiceStatus::PendingApproval, InvoiceStatus::Draft)
            .with_meta("reason", "duplicate invoice")
            .with_meta("step_number", 2);

        assert_eq!(entry.workflow_id, Some(wf));
        assert_eq!(entry.step_id, None);
        assert_eq!(entry.meta_str("reason"), Some("duplicate invoice"));
        assert_eq!(entry.metadata["step_number"], serde_json::json!(2));
        assert_eq!(entry.status_after, Some(InvoiceStatus::Draft));
    }

    #[tokio::test]
    async fn test_ledger_records_and_reads() {
        let store = Arc::new(RecordingStore::default());
        let ledger = AuditLedger::new(store.clone());
        let invoice = Uuid::new_v4();

        ledger
            .record(AuditEntry::new(invoice, "ent", AuditAction::Submitted, "alice"))
            .await;
        ledger
            .record(AuditEntry::new(Uuid::new_v4(), "ent", AuditAction::Submitted, "alice"))
            .await;

        let history = ledger.history_for_invoice(invoice, "ent").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, AuditAction::Submitted);
    }

    #[tokio::test]
    async fn test_ledger_swallows_append_failure() {
        let ledger = AuditLedger::new(Arc::new(BrokenStore));
        ledger
            .record(AuditEntry::new(Uuid::new_v4(), "ent", AuditAction::Approved, "bob"))
            .await;
        assert!(ledger.history_for_invoice(Uuid::new_v4(), "ent").await.is_err());
    }
}
