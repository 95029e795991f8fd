//! # Approvals Core
//!
//! Invoice approval routing and workflow state engine.
//! Provides the rule matcher, step builder, workflow and audit persistence,
//! notifications, configuration, and the approval router.

pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod invoice;
pub mod notify;
pub mod rules;
pub mod store;
pub mod workflow;

// Re-export commonly used types at the crate root.
pub use audit::{AuditAction, AuditEntry, AuditLedger};
pub use config::{ApprovalsConfig, RoutingConfig};
pub use error::{ApprovalError, ErrorKind, Result};
pub use identity::{IdentityResolver, StaticIdentityResolver};
pub use invoice::{Invoice, InvoiceLine, InvoiceStatus, InvoiceStore, NewInvoice};
pub use notify::{NotificationEvent, NotificationPublisher, NotificationType};
pub use rules::{ApprovalRule, RuleStep, RuleType};
pub use store::{AuditStore, RuleStore, SqliteStore, WorkflowStore};
pub use workflow::{
    ApprovalRouter, ApprovalStep, ApprovalWorkflow, Collaborators, StepStatus, WorkflowStatus,
};
