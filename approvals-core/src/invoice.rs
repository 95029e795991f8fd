//! Invoice collaborator interface.
//!
//! The engine never computes invoice totals; it reads them from whatever
//! implements [`InvoiceStore`] and asks that store to move the invoice
//! between statuses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ApprovalError, Result};

/// Lifecycle status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    PendingApproval,
    Approved,
    Posted,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::PendingApproval => "pending_approval",
            InvoiceStatus::Approved => "approved",
            InvoiceStatus::Posted => "posted",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = ApprovalError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "pending_approval" => Ok(InvoiceStatus::PendingApproval),
            "approved" => Ok(InvoiceStatus::Approved),
            "posted" => Ok(InvoiceStatus::Posted),
            "paid" => Ok(InvoiceStatus::Paid),
            "void" => Ok(InvoiceStatus::Void),
            other => Err(ApprovalError::invalid_input(
                "status",
                format!("unknown invoice status '{other}'"),
            )),
        }
    }
}

/// A single invoice line. Only the department dimension matters for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub line_number: u32,
    pub account_id: String,
    pub description: String,
    pub amount: i64,
    #[serde(default)]
    pub tax_amount: i64,
    #[serde(default)]
    pub department: Option<String>,
}

/// Invoice header as seen by the approval engine. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub entity_id: String,
    pub vendor_id: String,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub subtotal: i64,
    pub tax_amount: i64,
    pub total_amount: i64,
    pub amount_paid: i64,
    pub amount_due: i64,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub lines: Vec<InvoiceLine>,
}

impl Invoice {
    /// Department used for rule matching: the first line's department, if any.
    pub fn routing_department(&self) -> Option<&str> {
        self.lines.first().and_then(|l| l.department.as_deref())
    }
}

/// Data needed to seed a draft invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub entity_id: String,
    pub vendor_id: String,
    pub invoice_number: String,
    pub lines: Vec<InvoiceLine>,
}

/// Invoice store consumed by the engine.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Load an invoice with its lines.
    async fn get_invoice(&self, id: Uuid, entity_id: &str) -> Result<Invoice>;

    /// Mark the invoice approved, recording the approver.
    async fn approve_invoice(
        &self,
        id: Uuid,
        entity_id: &str,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<()>;

    /// Move the invoice to `status`.
    async fn update_invoice_status(
        &self,
        id: Uuid,
        entity_id: &str,
        status: InvoiceStatus,
        actor: Option<&str>,
    ) -> Result<()>;
}
