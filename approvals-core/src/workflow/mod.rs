//! Approval workflows.
//!
//! Types for workflow headers and steps, the step builder that instantiates
//! a rule's template, actor authorization, and the router that drives a
//! workflow through submit, approve, reject, recall, and delegate.

pub mod authz;
pub mod builder;
pub mod router;
pub mod types;

pub use authz::{can_act, ensure_can_act};
pub use builder::StepBuilder;
pub use router::{ApprovalRouter, Collaborators};
pub use types::{
    ApprovalStep, ApprovalWorkflow, StepGuard, StepOutcome, StepStatus, WorkflowStatus,
    WorkflowTransition,
};
