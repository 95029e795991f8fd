//! Approval router: composes rule matching, step building, workflow
//! persistence, the audit ledger, and notifications into the operations
//! exposed to transport adapters.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditLedger};
use crate::config::RoutingConfig;
use crate::error::{ApprovalError, ErrorKind, Result};
use crate::identity::{IdentityResolver, resolve_assignees, resolve_roles};
use crate::invoice::{InvoiceStatus, InvoiceStore};
use crate::notify::{NotificationEvent, NotificationPublisher, NotificationType, dispatch};
use crate::rules::ApprovalRule;
use crate::store::{AuditStore, RuleStore, SqliteStore, WorkflowStore};
use crate::workflow::authz::{can_act, ensure_can_act};
use crate::workflow::builder::StepBuilder;
use crate::workflow::types::{
    ApprovalStep, ApprovalWorkflow, StepOutcome, StepStatus, WorkflowStatus, WorkflowTransition,
};

/// External dependencies of the router.
#[derive(Clone)]
pub struct Collaborators {
    pub rules: Arc<dyn RuleStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub audit: Arc<dyn AuditStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub identity: Arc<dyn IdentityResolver>,
    pub notifier: Arc<dyn NotificationPublisher>,
}

impl Collaborators {
    /// Every store backed by one SQLite database.
    pub fn sqlite(
        store: SqliteStore,
        identity: Arc<dyn IdentityResolver>,
        notifier: Arc<dyn NotificationPublisher>,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            rules: store.clone(),
            workflows: store.clone(),
            audit: store.clone(),
            invoices: store,
            identity,
            notifier,
        }
    }
}

/// Orchestrates approval workflows over invoices.
pub struct ApprovalRouter {
    rules: Arc<dyn RuleStore>,
    workflows: Arc<dyn WorkflowStore>,
    invoices: Arc<dyn InvoiceStore>,
    identity: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn NotificationPublisher>,
    ledger: AuditLedger,
    builder: StepBuilder,
    admin_roles: Vec<String>,
}

/// Invoice store faults other than the engine taxonomy surface as collaborator failures.
fn invoice_error(err: ApprovalError) -> ApprovalError {
    match err.kind() {
        ErrorKind::Internal => ApprovalError::Collaborator {
            service: "invoice_store",
            message: err.to_string(),
        },
        _ => err,
    }
}

/// Approve and reject act only on invoices still awaiting approval.
fn ensure_pending_invoice(invoice_id: Uuid, status: InvoiceStatus) -> Result<()> {
    if status == InvoiceStatus::PendingApproval {
        Ok(())
    } else {
        Err(ApprovalError::conflict(format!(
            "invoice {invoice_id} is {status}, not pending approval"
        )))
    }
}

/// Log an invoice update that failed after the workflow change committed.
fn sync_failure(result: Result<()>, invoice_id: Uuid, workflow_id: Uuid) -> Option<ApprovalError> {
    let err = invoice_error(result.err()?);
    tracing::error!(
        %invoice_id,
        %workflow_id,
        error = %err,
        "Invoice update failed after workflow change committed"
    );
    Some(err)
}

fn with_sync_failure(entry: AuditEntry, failure: Option<&ApprovalError>) -> AuditEntry {
    match failure {
        Some(err) => entry.with_meta("invoice_sync_error", err.to_string()),
        None => entry,
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(ApprovalError::invalid_input(field, "must not be empty"))
    } else {
        Ok(())
    }
}

impl ApprovalRouter {
    pub fn new(collaborators: Collaborators, routing: &RoutingConfig) -> Self {
        Self {
            builder: StepBuilder::new(collaborators.identity.clone(), routing),
            ledger: AuditLedger::new(collaborators.audit),
            rules: collaborators.rules,
            workflows: collaborators.workflows,
            invoices: collaborators.invoices,
            identity: collaborators.identity,
            notifier: collaborators.notifier,
            admin_roles: routing.admin_roles.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Submit a draft invoice: match a rule, build and persist the workflow,
    /// then move the invoice to `pending_approval`.
    pub async fn submit_for_approval(
        &self,
        invoice_id: Uuid,
        entity_id: &str,
        submitter: &str,
        notes: Option<&str>,
    ) -> Result<(ApprovalWorkflow, Vec<ApprovalStep>)> {
        require("submitted_by", submitter)?;
        let invoice = self
            .invoices
            .get_invoice(invoice_id, entity_id)
            .await
            .map_err(invoice_error)?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(ApprovalError::conflict(format!(
                "invoice {invoice_id} is {}; only draft invoices can be submitted",
                invoice.status
            )));
        }
        if invoice.lines.is_empty() {
            return Err(ApprovalError::invalid_input(
                "lines",
                "invoice must have at least one line",
            ));
        }
        if let Some(active) = self.workflows.get_active_workflow(invoice_id, entity_id).await? {
            return Err(ApprovalError::conflict(format!(
                "invoice {invoice_id} already has active workflow {}",
                active.id
            )));
        }

        let rule = self
            .rules
            .find_matching_rule(
                entity_id,
                invoice.total_amount,
                Some(invoice.vendor_id.as_str()),
                invoice.routing_department(),
            )
            .await?;
        let defs = self.builder.resolve_step_defs(rule.as_ref());
        let steps = self.builder.build_steps(entity_id, &defs).await;
        let total_steps = u32::try_from(steps.len())
            .map_err(|_| ApprovalError::invalid_input("steps", "too many approval steps"))?;
        let rule_id = rule.as_ref().map(|r| r.id);

        let workflow = ApprovalWorkflow::new(
            invoice_id,
            entity_id,
            rule_id,
            total_steps,
            submitter,
            notes.map(String::from),
        );
        let (workflow, steps) = self.workflows.create_workflow(workflow, steps).await?;

        if let Err(e) = self
            .invoices
            .update_invoice_status(invoice_id, entity_id, InvoiceStatus::PendingApproval, Some(submitter))
            .await
        {
            tracing::warn!(
                %invoice_id,
                workflow_id = %workflow.id,
                error = %e,
                "Invoice status update failed after workflow creation; recalling workflow"
            );
            if let Err(recall_err) = self.workflows.recall_workflow(workflow.id, Utc::now()).await {
                tracing::error!(
                    workflow_id = %workflow.id,
                    error = %recall_err,
                    "Failed to recall orphaned workflow"
                );
            }
            return Err(invoice_error(e));
        }

        self.ledger
            .record(
                AuditEntry::new(invoice_id, entity_id, AuditAction::Submitted, submitter)
                    .for_workflow(workflow.id)
                    .with_statuses(invoice.status, InvoiceStatus::PendingApproval)
                    .with_meta("rule_id", rule_id.map(|id| id.to_string()))
                    .with_meta("total_steps", workflow.total_steps)
                    .with_meta("amount", invoice.total_amount),
            )
            .await;

        let first_holder = steps.first().and_then(|s| s.current_holder()).map(String::from);
        self.notify(
            NotificationEvent::new(NotificationType::InvoiceSubmitted, entity_id, submitter, invoice_id)
                .with_recipients(std::iter::once(submitter.to_string()).chain(first_holder))
                .with_payload("invoice_number", invoice.invoice_number.clone())
                .with_payload("total_amount", invoice.total_amount)
                .with_payload("workflow_id", workflow.id.to_string()),
        )
        .await;

        tracing::info!(
            %invoice_id,
            workflow_id = %workflow.id,
            rule_id = ?rule_id,
            total_steps = workflow.total_steps,
            actor = submitter,
            "Invoice submitted for approval"
        );
        Ok((workflow, steps))
    }

    /// Approve the current step. Returns `true` when this completed the workflow.
    pub async fn approve_step(
        &self,
        entity_id: &str,
        invoice_id: Uuid,
        workflow_id: Uuid,
        step_number: u32,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        require("actor", actor)?;
        let (workflow, step) = self
            .load_current_step(entity_id, Some(invoice_id), workflow_id, step_number)
            .await?;
        ensure_can_act(&step, actor)?;
        let before = self.invoice_status(invoice_id, entity_id).await?;
        ensure_pending_invoice(invoice_id, before)?;

        let now = Utc::now();
        let complete = workflow.is_last_step(step_number);
        let transition = if complete {
            WorkflowTransition::Finish {
                status: WorkflowStatus::Approved,
                at: now,
            }
        } else {
            WorkflowTransition::Advance {
                from: step_number,
                to: step_number + 1,
            }
        };
        self.workflows
            .complete_step(
                workflow_id,
                step_number,
                step.guard(),
                StepOutcome {
                    status: StepStatus::Approved,
                    acted_by: actor.to_string(),
                    notes: notes.map(String::from),
                    acted_at: now,
                },
                transition,
            )
            .await?;

        // The decision is committed; everything below is recorded, never unwound.
        let failure = if complete {
            let result = self
                .invoices
                .approve_invoice(invoice_id, entity_id, actor, notes)
                .await;
            sync_failure(result, invoice_id, workflow_id)
        } else {
            None
        };
        let after = if complete && failure.is_none() {
            InvoiceStatus::Approved
        } else {
            before
        };

        self.ledger
            .record(with_sync_failure(
                AuditEntry::new(invoice_id, entity_id, AuditAction::Approved, actor)
                    .for_workflow(workflow_id)
                    .for_step(step.id)
                    .with_statuses(before, after)
                    .with_meta("step_number", step_number)
                    .with_meta("notes", notes)
                    .with_meta("workflow_complete", complete),
                failure.as_ref(),
            ))
            .await;

        if let Some(err) = failure {
            return Err(err);
        }

        if complete {
            self.notify(
                NotificationEvent::new(NotificationType::InvoiceApproved, entity_id, actor, invoice_id)
                    .with_recipients([workflow.submitted_by.clone()])
                    .with_payload("workflow_id", workflow_id.to_string()),
            )
            .await;
        } else {
            match self.workflows.get_step(workflow_id, step_number + 1).await {
                Ok(next) => {
                    let recipients = self.step_recipients(entity_id, &next).await;
                    self.notify(
                        NotificationEvent::new(
                            NotificationType::InvoiceApprovalRequired,
                            entity_id,
                            actor,
                            invoice_id,
                        )
                        .with_recipients(recipients)
                        .with_payload("workflow_id", workflow_id.to_string())
                        .with_payload("step_number", next.step_number)
                        .with_payload("required_role", next.required_role.clone()),
                    )
                    .await;
                }
                Err(e) => tracing::warn!(
                    %workflow_id,
                    step_number = step_number + 1,
                    error = %e,
                    "Next step lookup failed; approval-required notification skipped"
                ),
            }
        }

        tracing::info!(
            %invoice_id,
            %workflow_id,
            step_number,
            actor,
            workflow_complete = complete,
            "Approval step approved"
        );
        Ok(complete)
    }

    /// Reject the workflow at its current step and return the invoice to draft.
    pub async fn reject_workflow(
        &self,
        entity_id: &str,
        invoice_id: Uuid,
        workflow_id: Uuid,
        step_number: u32,
        actor: &str,
        reason: &str,
    ) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(ApprovalError::invalid_input(
                "reason",
                "a rejection reason is required",
            ));
        }
        require("actor", actor)?;
        let (workflow, step) = self
            .load_current_step(entity_id, Some(invoice_id), workflow_id, step_number)
            .await?;
        ensure_can_act(&step, actor)?;
        let before = self.invoice_status(invoice_id, entity_id).await?;
        ensure_pending_invoice(invoice_id, before)?;

        let now = Utc::now();
        self.workflows
            .complete_step(
                workflow_id,
                step_number,
                step.guard(),
                StepOutcome {
                    status: StepStatus::Rejected,
                    acted_by: actor.to_string(),
                    notes: Some(reason.to_string()),
                    acted_at: now,
                },
                WorkflowTransition::Finish {
                    status: WorkflowStatus::Rejected,
                    at: now,
                },
            )
            .await?;

        let result = self
            .invoices
            .update_invoice_status(invoice_id, entity_id, InvoiceStatus::Draft, Some(actor))
            .await;
        let failure = sync_failure(result, invoice_id, workflow_id);
        let after = if failure.is_none() {
            InvoiceStatus::Draft
        } else {
            before
        };

        self.ledger
            .record(with_sync_failure(
                AuditEntry::new(invoice_id, entity_id, AuditAction::Rejected, actor)
                    .for_workflow(workflow_id)
                    .for_step(step.id)
                    .with_statuses(before, after)
                    .with_meta("step_number", step_number)
                    .with_meta("reason", reason),
                failure.as_ref(),
            ))
            .await;

        if let Some(err) = failure {
            return Err(err);
        }

        self.notify(
            NotificationEvent::new(NotificationType::InvoiceRejected, entity_id, actor, invoice_id)
                .with_recipients([workflow.submitted_by.clone()])
                .with_payload("reason", reason)
                .with_payload("step_number", step_number),
        )
        .await;

        tracing::info!(%invoice_id, %workflow_id, step_number, actor, "Approval workflow rejected");
        Ok(())
    }

    /// Withdraw an active workflow. Only the original submitter may recall.
    ///
    /// The invoice returns to draft only while it is still pending approval;
    /// an invoice moved elsewhere out of band keeps its status.
    pub async fn recall_workflow(
        &self,
        entity_id: &str,
        invoice_id: Uuid,
        workflow_id: Uuid,
        actor: &str,
    ) -> Result<()> {
        let workflow = self.workflows.get_workflow(workflow_id, entity_id).await?;
        if workflow.invoice_id != invoice_id {
            return Err(ApprovalError::invalid_input(
                "workflow_id",
                format!("workflow {workflow_id} does not belong to invoice {invoice_id}"),
            ));
        }
        if workflow.submitted_by != actor {
            return Err(ApprovalError::unauthorized(format!(
                "only the submitter may recall workflow {workflow_id}"
            )));
        }
        if !workflow.status.is_active() {
            return Err(ApprovalError::conflict(format!(
                "workflow {workflow_id} is {} and cannot be recalled",
                workflow.status
            )));
        }
        let before = self.invoice_status(invoice_id, entity_id).await?;

        let recalled = self.workflows.recall_workflow(workflow_id, Utc::now()).await?;

        let failure = if before == InvoiceStatus::PendingApproval {
            let result = self
                .invoices
                .update_invoice_status(invoice_id, entity_id, InvoiceStatus::Draft, Some(actor))
                .await;
            sync_failure(result, invoice_id, workflow_id)
        } else {
            tracing::warn!(
                %invoice_id,
                %workflow_id,
                status = %before,
                "Invoice not pending approval; status left unchanged by recall"
            );
            None
        };
        let after = if before == InvoiceStatus::PendingApproval && failure.is_none() {
            InvoiceStatus::Draft
        } else {
            before
        };

        self.ledger
            .record(with_sync_failure(
                AuditEntry::new(invoice_id, entity_id, AuditAction::Recalled, actor)
                    .for_workflow(workflow_id)
                    .with_statuses(before, after)
                    .with_meta("recalled_steps", recalled.len()),
                failure.as_ref(),
            ))
            .await;

        if let Some(err) = failure {
            return Err(err);
        }

        let holders: Vec<String> = recalled
            .iter()
            .filter_map(|s| s.current_holder().map(String::from))
            .collect();
        self.notify(
            NotificationEvent::new(NotificationType::InvoiceRecalled, entity_id, actor, invoice_id)
                .with_recipients(holders)
                .with_payload("workflow_id", workflow_id.to_string()),
        )
        .await;

        tracing::info!(
            %invoice_id,
            %workflow_id,
            actor,
            recalled_steps = recalled.len(),
            "Approval workflow recalled"
        );
        Ok(())
    }

    /// Hand the current step to another user without moving the workflow.
    pub async fn delegate_step(
        &self,
        entity_id: &str,
        workflow_id: Uuid,
        step_number: u32,
        delegator: &str,
        delegatee: &str,
        reason: &str,
    ) -> Result<ApprovalStep> {
        if reason.trim().is_empty() {
            return Err(ApprovalError::invalid_input(
                "reason",
                "a delegation reason is required",
            ));
        }
        require("delegator", delegator)?;
        require("delegatee", delegatee)?;
        if delegatee == delegator {
            return Err(ApprovalError::invalid_input(
                "delegatee",
                "cannot delegate a step to yourself",
            ));
        }
        let (workflow, step) = self
            .load_current_step(entity_id, None, workflow_id, step_number)
            .await?;
        ensure_can_act(&step, delegator)?;

        let updated = self
            .workflows
            .delegate_step(workflow_id, step_number, step.guard(), delegatee, reason, Utc::now())
            .await?;

        self.ledger
            .record(
                AuditEntry::new(workflow.invoice_id, entity_id, AuditAction::Delegated, delegator)
                    .for_workflow(workflow_id)
                    .for_step(step.id)
                    .with_meta("step_number", step_number)
                    .with_meta("delegator", delegator)
                    .with_meta("delegatee", delegatee)
                    .with_meta("reason", reason),
            )
            .await;

        self.notify(
            NotificationEvent::new(
                NotificationType::InvoiceDelegated,
                entity_id,
                delegator,
                workflow.invoice_id,
            )
            .with_recipients([delegatee])
            .with_payload("workflow_id", workflow_id.to_string())
            .with_payload("step_number", step_number)
            .with_payload("reason", reason),
        )
        .await;

        tracing::info!(
            invoice_id = %workflow.invoice_id,
            %workflow_id,
            step_number,
            actor = delegator,
            delegatee,
            "Approval step delegated"
        );
        Ok(updated)
    }

    /// Administratively assign the current step to a different user,
    /// clearing any delegation. The actor must hold a configured admin role.
    pub async fn reassign_step(
        &self,
        entity_id: &str,
        workflow_id: Uuid,
        step_number: u32,
        actor: &str,
        new_assignee: &str,
    ) -> Result<ApprovalStep> {
        require("actor", actor)?;
        require("assignee", new_assignee)?;
        let roles = resolve_roles(self.identity.as_ref(), entity_id, actor)
            .await
            .ok_or_else(|| {
                ApprovalError::unauthorized(format!("roles for '{actor}' could not be resolved"))
            })?;
        if !roles.iter().any(|r| self.admin_roles.contains(r)) {
            return Err(ApprovalError::unauthorized(format!(
                "user '{actor}' does not hold an approval admin role"
            )));
        }
        let (workflow, step) = self
            .load_current_step(entity_id, None, workflow_id, step_number)
            .await?;

        let updated = self
            .workflows
            .reassign_step(workflow_id, step_number, step.guard(), new_assignee, Utc::now())
            .await?;

        self.ledger
            .record(
                AuditEntry::new(workflow.invoice_id, entity_id, AuditAction::Reassigned, actor)
                    .for_workflow(workflow_id)
                    .for_step(step.id)
                    .with_meta("step_number", step_number)
                    .with_meta("previous_assignee", step.assigned_to.clone())
                    .with_meta("previous_delegatee", step.delegated_to.clone())
                    .with_meta("new_assignee", new_assignee),
            )
            .await;

        self.notify(
            NotificationEvent::new(
                NotificationType::InvoiceApprovalRequired,
                entity_id,
                actor,
                workflow.invoice_id,
            )
            .with_recipients([new_assignee])
            .with_payload("workflow_id", workflow_id.to_string())
            .with_payload("step_number", step_number),
        )
        .await;

        tracing::info!(
            invoice_id = %workflow.invoice_id,
            %workflow_id,
            step_number,
            actor,
            new_assignee,
            "Approval step reassigned"
        );
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn find_matching_rule(
        &self,
        entity_id: &str,
        amount: i64,
        vendor_id: Option<&str>,
        department: Option<&str>,
    ) -> Result<Option<ApprovalRule>> {
        self.rules
            .find_matching_rule(entity_id, amount, vendor_id, department)
            .await
    }

    pub async fn get_active_workflow(
        &self,
        invoice_id: Uuid,
        entity_id: &str,
    ) -> Result<Option<ApprovalWorkflow>> {
        self.workflows.get_active_workflow(invoice_id, entity_id).await
    }

    pub async fn get_workflow(&self, workflow_id: Uuid, entity_id: &str) -> Result<ApprovalWorkflow> {
        self.workflows.get_workflow(workflow_id, entity_id).await
    }

    /// Steps of the invoice's active workflow.
    pub async fn get_workflow_steps(&self, invoice_id: Uuid, entity_id: &str) -> Result<Vec<ApprovalStep>> {
        let workflow = self
            .workflows
            .get_active_workflow(invoice_id, entity_id)
            .await?
            .ok_or_else(|| {
                ApprovalError::not_found("active approval_workflow", invoice_id.to_string())
            })?;
        self.workflows.list_steps(workflow.id).await
    }

    /// Steps the user can act on now, soonest due first.
    pub async fn get_pending_approvals(&self, entity_id: &str, user_id: &str) -> Result<Vec<ApprovalStep>> {
        let roles = resolve_roles(self.identity.as_ref(), entity_id, user_id)
            .await
            .unwrap_or_default();
        let steps = self
            .workflows
            .pending_steps_for_user(entity_id, user_id, &roles)
            .await?;
        tracing::debug!(entity_id, user_id, count = steps.len(), "Pending approvals listed");
        Ok(steps)
    }

    /// Audit trail for an invoice, oldest first.
    pub async fn get_approval_history(
        &self,
        invoice_id: Uuid,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>> {
        self.ledger.history_for_invoice(invoice_id, entity_id).await
    }

    /// Audit trail for one workflow, oldest first.
    pub async fn get_workflow_history(
        &self,
        workflow_id: Uuid,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>> {
        self.workflows.get_workflow(workflow_id, entity_id).await?;
        self.ledger.history_for_workflow(workflow_id, entity_id).await
    }

    /// Actionable current steps past their due date.
    pub async fn get_overdue_steps(
        &self,
        entity_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ApprovalStep>> {
        self.workflows.overdue_steps(entity_id, as_of).await
    }

    /// Whether `user_id` may act on `step`.
    pub fn can_act(&self, step: &ApprovalStep, user_id: &str) -> bool {
        can_act(step, user_id)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Load the workflow and its current step, checking that the workflow is
    /// in progress on `step_number` and that the step is still actionable.
    async fn load_current_step(
        &self,
        entity_id: &str,
        invoice_id: Option<Uuid>,
        workflow_id: Uuid,
        step_number: u32,
    ) -> Result<(ApprovalWorkflow, ApprovalStep)> {
        let workflow = self.workflows.get_workflow(workflow_id, entity_id).await?;
        if let Some(invoice_id) = invoice_id {
            if workflow.invoice_id != invoice_id {
                return Err(ApprovalError::invalid_input(
                    "workflow_id",
                    format!("workflow {workflow_id} does not belong to invoice {invoice_id}"),
                ));
            }
        }
        if workflow.status != WorkflowStatus::InProgress {
            return Err(ApprovalError::conflict(format!(
                "workflow {workflow_id} is {}, not in_progress",
                workflow.status
            )));
        }
        if workflow.current_step != step_number {
            return Err(ApprovalError::conflict(format!(
                "step {step_number} is not the current step (current step is {})",
                workflow.current_step
            )));
        }
        let step = self.workflows.get_step(workflow_id, step_number).await?;
        if !step.status.is_actionable() {
            return Err(ApprovalError::conflict(format!(
                "step {step_number} is {} and cannot be acted on",
                step.status
            )));
        }
        Ok((workflow, step))
    }

    async fn invoice_status(&self, invoice_id: Uuid, entity_id: &str) -> Result<InvoiceStatus> {
        self.invoices
            .get_invoice(invoice_id, entity_id)
            .await
            .map(|invoice| invoice.status)
            .map_err(invoice_error)
    }

    /// The step's holder, or every user of its role when unassigned.
    async fn step_recipients(&self, entity_id: &str, step: &ApprovalStep) -> Vec<String> {
        match step.current_holder() {
            Some(holder) => vec![holder.to_string()],
            None => resolve_assignees(self.identity.as_ref(), entity_id, &step.required_role).await,
        }
    }

    async fn notify(&self, event: NotificationEvent) {
        dispatch(self.notifier.as_ref(), event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityResolver;
    use crate::invoice::{InvoiceLine, NewInvoice};
    use crate::notify::{ChannelPublisher, NoopPublisher};
    use crate::rules::{RuleStep, RuleType};

    struct Harness {
        router: ApprovalRouter,
        store: SqliteStore,
    }

    fn harness() -> Harness {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = StaticIdentityResolver::new()
            .with_member("CLERK", "bob")
            .with_member("FINANCE_MANAGER", "fm")
            .with_member("FINANCE_ADMIN", "root");
        let router = ApprovalRouter::new(
            Collaborators::sqlite(store.clone(), Arc::new(identity), Arc::new(NoopPublisher)),
            &RoutingConfig::default(),
        );
        Harness { router, store }
    }

    async fn draft(store: &SqliteStore, amount: i64) -> Uuid {
        store
            .create_invoice(NewInvoice {
                entity_id: "ent".into(),
                vendor_id: "vendor-1".into(),
                invoice_number: format!("INV-{}", Uuid::new_v4()),
                lines: vec![InvoiceLine {
                    line_number: 1,
                    account_id: "6100".into(),
                    description: "services".into(),
                    amount,
                    tax_amount: 0,
                    department: None,
                }],
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_submit_without_rule_uses_default_role() {
        let h = harness();
        let invoice_id = draft(&h.store, 500).await;
        let (wf, steps) = h
            .router
            .submit_for_approval(invoice_id, "ent", "alice", None)
            .await
            .unwrap();
        assert_eq!(wf.total_steps, 1);
        assert_eq!(wf.rule_id, None);
        assert_eq!(steps[0].required_role, "FINANCE_MANAGER");
        assert_eq!(steps[0].assigned_to.as_deref(), Some("fm"));

        let invoice = h.store.get_invoice(invoice_id, "ent").await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_submit_twice_conflicts() {
        let h = harness();
        let invoice_id = draft(&h.store, 500).await;
        h.router
            .submit_for_approval(invoice_id, "ent", "alice", None)
            .await
            .unwrap();
        let err = h
            .router
            .submit_for_approval(invoice_id, "ent", "alice", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_submit_invoice_without_lines_is_invalid() {
        let h = harness();
        let invoice = h
            .store
            .create_invoice(NewInvoice {
                entity_id: "ent".into(),
                vendor_id: "v".into(),
                invoice_number: "EMPTY".into(),
                lines: vec![],
            })
            .await
            .unwrap();
        let err = h
            .router
            .submit_for_approval(invoice.id, "ent", "alice", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_delegate_requires_distinct_delegatee() {
        let h = harness();
        let invoice_id = draft(&h.store, 500).await;
        let (wf, _) = h
            .router
            .submit_for_approval(invoice_id, "ent", "alice", None)
            .await
            .unwrap();
        let err = h
            .router
            .delegate_step("ent", wf.id, 1, "fm", "fm", "self")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = h
            .router
            .delegate_step("ent", wf.id, 1, "fm", "carol", "  ")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_reassign_requires_admin_role() {
        let h = harness();
        let invoice_id = draft(&h.store, 500).await;
        let (wf, _) = h
            .router
            .submit_for_approval(invoice_id, "ent", "alice", None)
            .await
            .unwrap();

        let err = h
            .router
            .reassign_step("ent", wf.id, 1, "bob", "carol")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let step = h
            .router
            .reassign_step("ent", wf.id, 1, "root", "carol")
            .await
            .unwrap();
        assert_eq!(step.assigned_to.as_deref(), Some("carol"));
        assert!(h.router.can_act(&step, "carol"));
        assert!(!h.router.can_act(&step, "fm"));

        let history = h.router.get_workflow_history(wf.id, "ent").await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.action, AuditAction::Reassigned);
        assert_eq!(last.meta_str("previous_assignee"), Some("fm"));
        assert_eq!(last.meta_str("new_assignee"), Some("carol"));
    }

    #[tokio::test]
    async fn test_notifications_follow_the_workflow() {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = StaticIdentityResolver::new()
            .with_member("CLERK", "bob")
            .with_member("CFO", "cathy");
        let (publisher, mut rx) = ChannelPublisher::channel();
        let router = ApprovalRouter::new(
            Collaborators::sqlite(store.clone(), Arc::new(identity), Arc::new(publisher)),
            &RoutingConfig::default(),
        );
        store
            .create_rule(ApprovalRule::new(
                "ent",
                "two-step",
                RuleType::AmountBased,
                vec![RuleStep::new(1, "CLERK", true), RuleStep::new(2, "CFO", true)],
                1,
            ))
            .await
            .unwrap();
        let invoice_id = draft(&store, 500).await;

        let (wf, _) = router
            .submit_for_approval(invoice_id, "ent", "alice", None)
            .await
            .unwrap();
        let submitted = rx.recv().await.unwrap();
        assert_eq!(submitted.event_type, NotificationType::InvoiceSubmitted);
        assert_eq!(submitted.recipients, vec!["alice".to_string(), "bob".to_string()]);

        router
            .approve_step("ent", invoice_id, wf.id, 1, "bob", None)
            .await
            .unwrap();
        let required = rx.recv().await.unwrap();
        assert_eq!(required.event_type, NotificationType::InvoiceApprovalRequired);
        assert_eq!(required.recipients, vec!["cathy".to_string()]);

        router
            .approve_step("ent", invoice_id, wf.id, 2, "cathy", Some("ok"))
            .await
            .unwrap();
        let approved = rx.recv().await.unwrap();
        assert_eq!(approved.event_type, NotificationType::InvoiceApproved);
        assert_eq!(approved.recipients, vec!["alice".to_string()]);
    }
}
