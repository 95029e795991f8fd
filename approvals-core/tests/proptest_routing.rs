//! Property-based tests for rule matching and step building using proptest.

use proptest::prelude::*;
use std::convert::Infallible;
use std::sync::Arc;

use approvals_core::config::RoutingConfig;
use approvals_core::identity::StaticIdentityResolver;
use approvals_core::rules::{MatchCriteria, first_match, sort_for_evaluation, validate_steps};
use approvals_core::workflow::StepBuilder;
use approvals_core::{ApprovalRule, RuleStep, RuleType, StepStatus};

fn amount_rule(name: &str, min: Option<i64>, max: Option<i64>, priority: i32) -> ApprovalRule {
    ApprovalRule::new(
        "acme",
        name,
        RuleType::AmountBased,
        vec![RuleStep::new(1, "CLERK", true)],
        priority,
    )
    .with_amount_range(min, max)
}

fn scan(rules: Vec<ApprovalRule>, amount: i64) -> Option<ApprovalRule> {
    let criteria = MatchCriteria::new(amount, None, None);
    first_match(rules.into_iter().map(Ok::<_, Infallible>), &criteria).unwrap_or(None)
}

// --- Amount bounds ---

proptest! {
    #[test]
    fn amount_match_respects_half_open_bounds(
        min in proptest::option::of(0i64..1_000_000),
        span in 0i64..1_000_000,
        has_max in any::<bool>(),
        amount in 0i64..3_000_000,
    ) {
        let max = has_max.then(|| min.unwrap_or(0) + span);
        let rule = amount_rule("bounded", min, max, 0);
        let expected = min.is_none_or(|m| amount >= m) && max.is_none_or(|m| amount < m);
        prop_assert_eq!(rule.matches(&MatchCriteria::new(amount, None, None)), expected);
    }

    #[test]
    fn upper_bound_is_exclusive(min in 0i64..100_000, span in 1i64..100_000) {
        let max = min + span;
        let rule = amount_rule("edge", Some(min), Some(max), 0);
        prop_assert!(rule.matches(&MatchCriteria::new(min, None, None)));
        prop_assert!(rule.matches(&MatchCriteria::new(max - 1, None, None)));
        prop_assert!(!rule.matches(&MatchCriteria::new(max, None, None)));
        if min > 0 {
            prop_assert!(!rule.matches(&MatchCriteria::new(min - 1, None, None)));
        }
    }

    #[test]
    fn vendor_rules_never_match_without_vendor(amount in 0i64..1_000_000) {
        let rule = ApprovalRule::new(
            "acme",
            "vendor",
            RuleType::VendorBased,
            vec![RuleStep::new(1, "AP", true)],
            0,
        )
        .with_vendor("v-1");
        prop_assert!(!rule.matches(&MatchCriteria::new(amount, None, Some("ops"))));
        prop_assert!(rule.matches(&MatchCriteria::new(amount, Some("v-1"), None)));
    }
}

// --- Priority ---

proptest! {
    #[test]
    fn lowest_priority_matching_rule_wins(
        priorities in proptest::collection::hash_set(-1000i32..1000, 2..8),
        amount in 0i64..1_000_000,
    ) {
        let mut rules: Vec<ApprovalRule> = priorities
            .iter()
            .map(|p| amount_rule(&format!("rule-{p}"), None, None, *p))
            .collect();
        sort_for_evaluation(&mut rules);
        let winner = scan(rules, amount).unwrap();
        prop_assert_eq!(winner.priority, *priorities.iter().min().unwrap());
    }

    #[test]
    fn non_matching_rules_are_skipped(
        low in -100i32..0,
        high in 0i32..100,
        amount in 5_000i64..10_000,
    ) {
        let mut rules = vec![
            amount_rule("small", Some(0), Some(1_000), low),
            amount_rule("large", Some(1_000), None, high),
        ];
        sort_for_evaluation(&mut rules);
        let winner = scan(rules, amount).unwrap();
        prop_assert_eq!(winner.name, "large");
    }
}

// --- Step building ---

proptest! {
    #[test]
    fn built_steps_are_contiguous_and_pending(n in 1u32..12) {
        let mut defs: Vec<RuleStep> = (1..=n).rev().map(|i| RuleStep::new(i, format!("ROLE_{i}"), true)).collect();
        prop_assert!(validate_steps(&defs).is_ok());
        defs.rotate_left((n / 2) as usize);

        let builder = StepBuilder::new(
            Arc::new(StaticIdentityResolver::new().with_member("ROLE_1", "first")),
            &RoutingConfig::default(),
        );
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let steps = rt.block_on(builder.build_steps("acme", &defs));

        prop_assert_eq!(steps.len(), n as usize);
        for (idx, step) in steps.iter().enumerate() {
            prop_assert_eq!(step.step_number, idx as u32 + 1);
            prop_assert_eq!(step.status, StepStatus::Pending);
            prop_assert_eq!(&step.required_role, &format!("ROLE_{}", idx + 1));
        }
        prop_assert_eq!(steps[0].assigned_to.as_deref(), Some("first"));
    }

    #[test]
    fn gapped_step_numbers_are_rejected(n in 2u32..10, gap in 1u32..5) {
        let defs: Vec<RuleStep> = (1..=n)
            .map(|i| RuleStep::new(if i == n { i + gap } else { i }, "AP", true))
            .collect();
        prop_assert!(validate_steps(&defs).is_err());
    }
}
