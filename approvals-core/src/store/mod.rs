//! Persistence interfaces for rules, workflows, and the audit ledger.
//!
//! Every state-changing workflow call is conditional on the prior status it
//! expects. When another actor got there first the call fails with a
//! conflict instead of silently overwriting.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::Result;
use crate::rules::ApprovalRule;
use crate::workflow::types::{
    ApprovalStep, ApprovalWorkflow, StepGuard, StepOutcome, WorkflowTransition,
};

/// Rule administration and lookup.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create_rule(&self, rule: ApprovalRule) -> Result<ApprovalRule>;

    async fn get_rule(&self, id: Uuid, entity_id: &str) -> Result<ApprovalRule>;

    /// Rules ordered by priority, then name.
    async fn list_rules(&self, entity_id: &str, active_only: bool) -> Result<Vec<ApprovalRule>>;

    async fn update_rule(&self, rule: ApprovalRule) -> Result<ApprovalRule>;

    async fn delete_rule(&self, id: Uuid, entity_id: &str) -> Result<()>;

    /// First active rule, by ascending priority, whose predicate holds.
    async fn find_matching_rule(
        &self,
        entity_id: &str,
        amount: i64,
        vendor_id: Option<&str>,
        department: Option<&str>,
    ) -> Result<Option<ApprovalRule>>;
}

/// Workflow and step persistence.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist the header and all of its steps in one transaction.
    ///
    /// Step references (workflow, invoice, entity) are taken from the header.
    /// Returns the rows as stored.
    async fn create_workflow(
        &self,
        workflow: ApprovalWorkflow,
        steps: Vec<ApprovalStep>,
    ) -> Result<(ApprovalWorkflow, Vec<ApprovalStep>)>;

    async fn get_workflow(&self, id: Uuid, entity_id: &str) -> Result<ApprovalWorkflow>;

    /// The invoice's pending or in-progress workflow, if any.
    async fn get_active_workflow(
        &self,
        invoice_id: Uuid,
        entity_id: &str,
    ) -> Result<Option<ApprovalWorkflow>>;

    /// Steps ordered by step number.
    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<ApprovalStep>>;

    async fn get_step(&self, workflow_id: Uuid, step_number: u32) -> Result<ApprovalStep>;

    /// Record a decision on the current step and apply `transition` to the
    /// workflow, atomically.
    ///
    /// The step must still be actionable and match `expected`, and the
    /// workflow must still be in progress on `step_number`.
    async fn complete_step(
        &self,
        workflow_id: Uuid,
        step_number: u32,
        expected: StepGuard,
        outcome: StepOutcome,
        transition: WorkflowTransition,
    ) -> Result<()>;

    /// Hand the current step to `delegatee`. The step must still match `expected`.
    async fn delegate_step(
        &self,
        workflow_id: Uuid,
        step_number: u32,
        expected: StepGuard,
        delegatee: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ApprovalStep>;

    /// Assign the current step to `assignee`, clearing any delegation.
    /// The step must still match `expected`.
    async fn reassign_step(
        &self,
        workflow_id: Uuid,
        step_number: u32,
        expected: StepGuard,
        assignee: &str,
        at: DateTime<Utc>,
    ) -> Result<ApprovalStep>;

    /// Close an active workflow as recalled and recall every actionable step.
    /// Returns the steps that were recalled.
    async fn recall_workflow(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<Vec<ApprovalStep>>;

    /// Current actionable steps of in-progress workflows held by `user_id`,
    /// plus unassigned ones whose role is in `roles`.
    async fn pending_steps_for_user(
        &self,
        entity_id: &str,
        user_id: &str,
        roles: &[String],
    ) -> Result<Vec<ApprovalStep>>;

    /// Current actionable steps due before `as_of`.
    async fn overdue_steps(&self, entity_id: &str, as_of: DateTime<Utc>) -> Result<Vec<ApprovalStep>>;
}

/// Append-only audit persistence.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;

    /// Entries for the invoice, ordered by `performed_at` then insertion.
    async fn audit_for_invoice(&self, invoice_id: Uuid, entity_id: &str) -> Result<Vec<AuditEntry>>;

    async fn audit_for_workflow(&self, workflow_id: Uuid, entity_id: &str) -> Result<Vec<AuditEntry>>;
}
