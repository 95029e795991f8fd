//! Workflow type definitions for the approval engine.
//!
//! Defines the workflow header, its ordered steps, their statuses, and the
//! transition records handed to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ApprovalError;

/// Status of an approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Recalled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Rejected => "rejected",
            WorkflowStatus::Recalled => "recalled",
        }
    }

    /// Active workflows are the ones still awaiting a decision.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkflowStatus::Pending | WorkflowStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "approved" => Ok(WorkflowStatus::Approved),
            "rejected" => Ok(WorkflowStatus::Rejected),
            "recalled" => Ok(WorkflowStatus::Recalled),
            other => Err(ApprovalError::invalid_input(
                "status",
                format!("unknown workflow status '{other}'"),
            )),
        }
    }
}

/// Status of a single approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Delegated,
    Recalled,
    Skipped,
}

impl StepStatus {
    /// Statuses from which a step can still be approved, rejected, or delegated.
    pub const ACTIONABLE: [StepStatus; 2] = [StepStatus::Pending, StepStatus::Delegated];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
            StepStatus::Delegated => "delegated",
            StepStatus::Recalled => "recalled",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_actionable(&self) -> bool {
        Self::ACTIONABLE.contains(self)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "approved" => Ok(StepStatus::Approved),
            "rejected" => Ok(StepStatus::Rejected),
            "delegated" => Ok(StepStatus::Delegated),
            "recalled" => Ok(StepStatus::Recalled),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(ApprovalError::invalid_input(
                "status",
                format!("unknown step status '{other}'"),
            )),
        }
    }
}

/// One approval run over an invoice submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub entity_id: String,
    pub rule_id: Option<Uuid>,
    pub status: WorkflowStatus,
    pub total_steps: u32,
    /// 1-based pointer into the step sequence.
    pub current_step: u32,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub submission_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalWorkflow {
    /// Create an in-progress workflow positioned on step 1.
    pub fn new(
        invoice_id: Uuid,
        entity_id: impl Into<String>,
        rule_id: Option<Uuid>,
        total_steps: u32,
        submitted_by: impl Into<String>,
        submission_notes: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            entity_id: entity_id.into(),
            rule_id,
            status: WorkflowStatus::InProgress,
            total_steps,
            current_step: 1,
            submitted_by: submitted_by.into(),
            submitted_at: now,
            completed_at: None,
            submission_notes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_last_step(&self, step_number: u32) -> bool {
        step_number >= self.total_steps
    }
}

/// A single sign-off gate within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub invoice_id: Uuid,
    pub entity_id: String,
    pub step_number: u32,
    pub required_role: String,
    pub is_required: bool,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub delegated_to: Option<String>,
    pub delegated_at: Option<DateTime<Utc>>,
    pub delegated_reason: Option<String>,
    pub status: StepStatus,
    pub acted_by: Option<String>,
    pub acted_at: Option<DateTime<Utc>>,
    pub action_notes: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalStep {
    /// Create an unpersisted, unassigned pending step.
    ///
    /// Workflow, invoice, and entity references are filled in by the store
    /// when the step is created alongside its workflow.
    pub fn pending(step_number: u32, required_role: impl Into<String>, is_required: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: Uuid::nil(),
            invoice_id: Uuid::nil(),
            entity_id: String::new(),
            step_number,
            required_role: required_role.into(),
            is_required,
            assigned_to: None,
            assigned_at: None,
            delegated_to: None,
            delegated_at: None,
            delegated_reason: None,
            status: StepStatus::Pending,
            acted_by: None,
            acted_at: None,
            action_notes: None,
            due_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The user currently holding the step: the delegatee if delegated, else the assignee.
    pub fn current_holder(&self) -> Option<&str> {
        self.delegated_to.as_deref().or(self.assigned_to.as_deref())
    }

    /// The state a conditional update of this step must still find.
    pub fn guard(&self) -> StepGuard {
        StepGuard {
            status: self.status,
            assigned_to: self.assigned_to.clone(),
            delegated_to: self.delegated_to.clone(),
        }
    }
}

/// Step status and holders as last read by the caller.
///
/// Step writes match on these columns so a decision made against a stale
/// read (the step was reassigned or delegated in between) fails as a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepGuard {
    pub status: StepStatus,
    pub assigned_to: Option<String>,
    pub delegated_to: Option<String>,
}

/// Terminal decision recorded on a step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub acted_by: String,
    pub notes: Option<String>,
    pub acted_at: DateTime<Utc>,
}

/// How the workflow header moves after a step decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowTransition {
    /// Move the pointer from `from` to `to`; the workflow stays in progress.
    Advance { from: u32, to: u32 },
    /// Close the workflow with a terminal status.
    Finish {
        status: WorkflowStatus,
        at: DateTime<Utc>,
    },
}
