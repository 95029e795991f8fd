//! Step-level authorization.
//!
//! A delegated step belongs to its delegatee alone. Otherwise the assignee
//! may act, and a step with neither an assignee nor a delegatee is open to
//! any caller (role resolution was unavailable when it was built).

use crate::error::ApprovalError;
use crate::workflow::types::ApprovalStep;

/// Whether `user_id` may act on `step`.
pub fn can_act(step: &ApprovalStep, user_id: &str) -> bool {
    match (step.delegated_to.as_deref(), step.assigned_to.as_deref()) {
        (Some(delegatee), _) => delegatee == user_id,
        (None, Some(assignee)) => assignee == user_id,
        (None, None) => true,
    }
}

/// [`can_act`], surfaced as an `Unauthorized` error.
pub fn ensure_can_act(step: &ApprovalStep, user_id: &str) -> Result<(), ApprovalError> {
    if can_act(step, user_id) {
        Ok(())
    } else {
        Err(ApprovalError::unauthorized(format!(
            "user '{user_id}' is not authorized to act on approval step {}",
            step.step_number
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(assigned: Option<&str>, delegated: Option<&str>) -> ApprovalStep {
        let mut s = ApprovalStep::pending(1, "CLERK", true);
        s.assigned_to = assigned.map(String::from);
        s.delegated_to = delegated.map(String::from);
        s
    }

    #[test]
    fn test_unassigned_step_is_open() {
        let s = step(None, None);
        assert!(can_act(&s, "anyone"));
        assert!(ensure_can_act(&s, "").is_ok());
    }

    #[test]
    fn test_assignee_can_act_others_cannot() {
        let s = step(Some("bob"), None);
        assert!(can_act(&s, "bob"));
        assert!(!can_act(&s, "mallory"));
        assert!(matches!(
            ensure_can_act(&s, "mallory"),
            Err(ApprovalError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_delegation_transfers_authority() {
        let s = step(Some("bob"), Some("carol"));
        assert!(can_act(&s, "carol"));
        assert!(!can_act(&s, "bob"));
    }

    #[test]
    fn test_delegated_unassigned_step_is_closed_to_others() {
        let s = step(None, Some("carol"));
        assert!(can_act(&s, "carol"));
        assert!(!can_act(&s, "dave"));
    }
}
