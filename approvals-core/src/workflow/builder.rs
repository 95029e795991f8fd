//! Step builder: expands a rule's step template into unpersisted workflow steps.

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::identity::{IdentityResolver, resolve_assignees};
use crate::rules::{ApprovalRule, RuleStep};
use crate::workflow::types::ApprovalStep;

/// Builds ordered pending steps and resolves their initial assignees.
pub struct StepBuilder {
    identity: Arc<dyn IdentityResolver>,
    default_role: String,
    due_after: Option<Duration>,
}

impl StepBuilder {
    pub fn new(identity: Arc<dyn IdentityResolver>, routing: &RoutingConfig) -> Self {
        Self {
            identity,
            default_role: routing.default_role.clone(),
            due_after: routing
                .step_due_hours
                .and_then(|h| i64::try_from(h).ok())
                .and_then(Duration::try_hours),
        }
    }

    /// Step template of the matched rule, or a single required step with the
    /// configured default role when nothing matched.
    pub fn resolve_step_defs(&self, rule: Option<&ApprovalRule>) -> Vec<RuleStep> {
        match rule {
            Some(rule) if !rule.steps.is_empty() => rule.ordered_steps(),
            _ => vec![RuleStep::new(1, self.default_role.clone(), true)],
        }
    }

    /// Build one pending step per definition, in step-number order.
    ///
    /// Each step is assigned to the first user the identity resolver returns
    /// for its role. Lookup failures and empty results leave it unassigned.
    pub async fn build_steps(&self, entity_id: &str, defs: &[RuleStep]) -> Vec<ApprovalStep> {
        let mut defs = defs.to_vec();
        defs.sort_by_key(|d| d.step_number);

        let mut steps = Vec::with_capacity(defs.len());
        for def in defs {
            let mut step = ApprovalStep::pending(def.step_number, def.role.clone(), def.required);
            step.entity_id = entity_id.to_string();
            step.due_at = self
                .due_after
                .and_then(|d| step.created_at.checked_add_signed(d));

            let users = resolve_assignees(self.identity.as_ref(), entity_id, &def.role).await;
            if let Some(first) = users.into_iter().next() {
                step.assigned_to = Some(first);
                step.assigned_at = Some(Utc::now());
            } else {
                tracing::debug!(entity_id, role = %def.role, step_number = def.step_number, "Step left unassigned");
            }
            steps.push(step);
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{StaticIdentityResolver, UnavailableIdentityResolver};
    use crate::rules::RuleType;
    use crate::workflow::types::StepStatus;

    fn routing() -> RoutingConfig {
        RoutingConfig::default()
    }

    #[test]
    fn test_default_step_when_no_rule() {
        let builder = StepBuilder::new(Arc::new(StaticIdentityResolver::new()), &routing());
        let defs = builder.resolve_step_defs(None);
        assert_eq!(defs, vec![RuleStep::new(1, "FINANCE_MANAGER", true)]);
    }

    #[test]
    fn test_default_role_is_injected() {
        let mut cfg = routing();
        cfg.default_role = "CONTROLLER".into();
        let builder = StepBuilder::new(Arc::new(StaticIdentityResolver::new()), &cfg);
        assert_eq!(builder.resolve_step_defs(None)[0].role, "CONTROLLER");
    }

    #[test]
    fn test_rule_steps_are_ordered() {
        let builder = StepBuilder::new(Arc::new(StaticIdentityResolver::new()), &routing());
        let rule = ApprovalRule::new(
            "ent",
            "r",
            RuleType::AmountBased,
            vec![RuleStep::new(2, "CFO", true), RuleStep::new(1, "CLERK", false)],
            1,
        );
        let defs = builder.resolve_step_defs(Some(&rule));
        assert_eq!(defs[0].role, "CLERK");
        assert_eq!(defs[1].role, "CFO");
    }

    #[tokio::test]
    async fn test_build_steps_assigns_first_user() {
        let identity = StaticIdentityResolver::new()
            .with_member("CLERK", "alice")
            .with_member("CLERK", "bob");
        let builder = StepBuilder::new(Arc::new(identity), &routing());
        let steps = builder
            .build_steps(
                "ent",
                &[RuleStep::new(1, "CLERK", true), RuleStep::new(2, "CFO", true)],
            )
            .await;

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].assigned_to.as_deref(), Some("alice"));
        assert!(steps[0].assigned_at.is_some());
        assert_eq!(steps[1].assigned_to, None);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(steps.iter().all(|s| s.entity_id == "ent"));
        assert!(steps.iter().all(|s| s.due_at.is_none()));
    }

    #[tokio::test]
    async fn test_build_steps_survives_identity_outage() {
        let builder = StepBuilder::new(Arc::new(UnavailableIdentityResolver), &routing());
        let steps = builder
            .build_steps("ent", &[RuleStep::new(1, "CLERK", true)])
            .await;
        assert_eq!(steps.len(), 1);
        assert!(steps[0].assigned_to.is_none());
        assert!(steps[0].assigned_at.is_none());
    }

    #[tokio::test]
    async fn test_build_steps_stamps_due_at() {
        let mut cfg = routing();
        cfg.step_due_hours = Some(48);
        let builder = StepBuilder::new(Arc::new(StaticIdentityResolver::new()), &cfg);
        let steps = builder
            .build_steps("ent", &[RuleStep::new(1, "CLERK", true)])
            .await;
        let due = steps[0].due_at.unwrap();
        assert_eq!(due - steps[0].created_at, Duration::hours(48));
    }
    #[tokio::test]
    async fn test_build_steps_leaves_unrepresentable_due_at_unset() {
        let mut cfg = routing();
        cfg.step_due_hours = Some(1_000_000_000_000);
        let builder = StepBuilder::new(Arc::new(StaticIdentityResolver::new()), &cfg);
        let steps = builder
            .build_steps("ent", &[RuleStep::new(1, "CLERK", true)])
            .await;
        assert_eq!(steps.len(), 1);
        assert!(steps[0].due_at.is_none());
    }
}
