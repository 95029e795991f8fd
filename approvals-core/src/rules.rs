//! Approval routing rules and the rule matcher.
//!
//! Rules are entity-scoped policies selecting which step sequence applies to
//! an invoice. Active rules are evaluated in ascending priority order and the
//! first whose type-specific predicate holds wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ApprovalError;

/// How a rule decides whether it applies to an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    AmountBased,
    VendorBased,
    DepartmentBased,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::AmountBased => write!(f, "amount_based"),
            RuleType::VendorBased => write!(f, "vendor_based"),
            RuleType::DepartmentBased => write!(f, "department_based"),
        }
    }
}

impl FromStr for RuleType {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amount_based" => Ok(RuleType::AmountBased),
            "vendor_based" => Ok(RuleType::VendorBased),
            "department_based" => Ok(RuleType::DepartmentBased),
            other => Err(ApprovalError::invalid_input(
                "rule_type",
                format!("unknown rule type '{other}'"),
            )),
        }
    }
}

/// One entry of a rule's step template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStep {
    #[serde(rename = "step")]
    pub step_number: u32,
    pub role: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl RuleStep {
    pub fn new(step_number: u32, role: impl Into<String>, required: bool) -> Self {
        Self {
            step_number,
            role: role.into(),
            required,
        }
    }
}

/// Entity-scoped routing configuration.
///
/// Amounts are in minor currency units. The lower bound is inclusive and the
/// upper bound exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: Uuid,
    pub entity_id: String,
    pub name: String,
    pub rule_type: RuleType,
    pub is_active: bool,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub vendor_id: Option<String>,
    pub department: Option<String>,
    pub steps: Vec<RuleStep>,
    /// Lower values are evaluated first.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRule {
    /// Create an active rule with no criteria set.
    pub fn new(
        entity_id: impl Into<String>,
        name: impl Into<String>,
        rule_type: RuleType,
        steps: Vec<RuleStep>,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            name: name.into(),
            rule_type,
            is_active: true,
            min_amount: None,
            max_amount: None,
            vendor_id: None,
            department: None,
            steps,
            priority,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_amount_range(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min_amount = min;
        self.max_amount = max;
        self
    }

    pub fn with_vendor(mut self, vendor_id: impl Into<String>) -> Self {
        self.vendor_id = Some(vendor_id.into());
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Check the rule's structural invariants before it is persisted.
    pub fn validate(&self) -> Result<(), ApprovalError> {
        if self.entity_id.trim().is_empty() {
            return Err(ApprovalError::invalid_input("entity_id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ApprovalError::invalid_input("name", "must not be empty"));
        }
        for (field, bound) in [("min_amount", self.min_amount), ("max_amount", self.max_amount)] {
            if bound.is_some_and(|v| v < 0) {
                return Err(ApprovalError::invalid_input(field, "must be non-negative"));
            }
        }
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err(ApprovalError::invalid_input(
                    "min_amount",
                    format!("min_amount {min} exceeds max_amount {max}"),
                ));
            }
        }
        match self.rule_type {
            RuleType::VendorBased if is_blank(self.vendor_id.as_deref()) => {
                return Err(ApprovalError::invalid_input(
                    "vendor_id",
                    "vendor_based rules require a vendor",
                ));
            }
            RuleType::DepartmentBased if is_blank(self.department.as_deref()) => {
                return Err(ApprovalError::invalid_input(
                    "department",
                    "department_based rules require a department",
                ));
            }
            _ => {}
        }
        validate_steps(&self.steps)
    }

    /// Step template ordered by step number.
    pub fn ordered_steps(&self) -> Vec<RuleStep> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.step_number);
        steps
    }

    /// Whether this rule's type-specific predicate holds for the invoice attributes.
    pub fn matches(&self, criteria: &MatchCriteria<'_>) -> bool {
        match self.rule_type {
            RuleType::AmountBased => {
                if self.min_amount.is_some_and(|min| criteria.amount < min) {
                    return false;
                }
                if self.max_amount.is_some_and(|max| criteria.amount >= max) {
                    return false;
                }
                true
            }
            RuleType::VendorBased => match (self.vendor_id.as_deref(), criteria.vendor_id) {
                (Some(rule_vendor), Some(vendor)) => rule_vendor == vendor,
                _ => false,
            },
            RuleType::DepartmentBased => {
                match (self.department.as_deref(), criteria.department) {
                    (Some(rule_dept), Some(dept)) => rule_dept == dept,
                    _ => false,
                }
            }
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Step numbers must form the contiguous sequence `1..=N` and every role must be named.
pub fn validate_steps(steps: &[RuleStep]) -> Result<(), ApprovalError> {
    if steps.is_empty() {
        return Err(ApprovalError::invalid_input(
            "steps",
            "at least one approval step is required",
        ));
    }
    let mut numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
    numbers.sort_unstable();
    for (idx, number) in numbers.iter().enumerate() {
        let expected = idx as u32 + 1;
        if *number != expected {
            return Err(ApprovalError::invalid_input(
                "steps",
                format!("step numbers must be contiguous from 1; expected {expected}, found {number}"),
            ));
        }
    }
    if let Some(step) = steps.iter().find(|s| s.role.trim().is_empty()) {
        return Err(ApprovalError::invalid_input(
            "steps",
            format!("step {} has an empty role", step.step_number),
        ));
    }
    Ok(())
}

/// Invoice attributes a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchCriteria<'a> {
    pub amount: i64,
    pub vendor_id: Option<&'a str>,
    pub department: Option<&'a str>,
}

impl<'a> MatchCriteria<'a> {
    pub fn new(amount: i64, vendor_id: Option<&'a str>, department: Option<&'a str>) -> Self {
        Self {
            amount,
            vendor_id,
            department,
        }
    }
}

/// Return the first rule in `rules` that matches.
///
/// `rules` must already be in evaluation order (active only, ascending
/// priority). The scan stops at the first hit or the first error, so callers
/// can feed a lazy row iterator.
pub fn first_match<I, E>(rules: I, criteria: &MatchCriteria<'_>) -> Result<Option<ApprovalRule>, E>
where
    I: IntoIterator<Item = Result<ApprovalRule, E>>,
{
    for rule in rules {
        let rule = rule?;
        if rule.matches(criteria) {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

/// In-memory ordering used when rules are not pre-sorted by the store.
pub fn sort_for_evaluation(rules: &mut [ApprovalRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount_rule(min: Option<i64>, max: Option<i64>, priority: i32) -> ApprovalRule {
        ApprovalRule::new(
            "ent-1",
            format!("amount-{priority}"),
            RuleType::AmountBased,
            vec![RuleStep::new(1, "CLERK", true)],
            priority,
        )
        .with_amount_range(min, max)
    }

    #[test]
    fn test_rule_type_roundtrip() {
        for ty in [
            RuleType::AmountBased,
            RuleType::VendorBased,
            RuleType::DepartmentBased,
        ] {
            assert_eq!(ty.to_string().parse::<RuleType>().unwrap(), ty);
        }
        assert!("bogus".parse::<RuleType>().is_err());
    }

    #[test]
    fn test_amount_bounds_lower_inclusive_upper_exclusive() {
        let rule = amount_rule(Some(1000), Some(5000), 1);
        let at = |amount| rule.matches(&MatchCriteria::new(amount, None, None));
        assert!(at(1000));
        assert!(at(4999));
        assert!(!at(5000));
        assert!(!at(999));
    }

    #[test]
    fn test_amount_rule_open_bounds() {
        let rule = amount_rule(None, None, 1);
        assert!(rule.matches(&MatchCriteria::new(0, None, None)));
        assert!(rule.matches(&MatchCriteria::new(i64::MAX, None, None)));
    }

    #[test]
    fn test_vendor_rule_requires_both_sides() {
        let rule = ApprovalRule::new(
            "ent-1",
            "acme",
            RuleType::VendorBased,
            vec![RuleStep::new(1, "AP_LEAD", true)],
            1,
        )
        .with_vendor("vendor-acme");
        assert!(rule.matches(&MatchCriteria::new(10, Some("vendor-acme"), None)));
        assert!(!rule.matches(&MatchCriteria::new(10, Some("vendor-other"), None)));
        assert!(!rule.matches(&MatchCriteria::new(10, None, None)));
    }

    #[test]
    fn test_department_rule_without_department_never_matches() {
        let mut rule = ApprovalRule::new(
            "ent-1",
            "ops",
            RuleType::DepartmentBased,
            vec![RuleStep::new(1, "OPS_HEAD", true)],
            1,
        );
        assert!(!rule.matches(&MatchCriteria::new(10, None, Some("OPS"))));
        rule.department = Some("OPS".into());
        assert!(rule.matches(&MatchCriteria::new(10, None, Some("OPS"))));
    }

    fn scan(rules: Vec<ApprovalRule>, amount: i64) -> Option<ApprovalRule> {
        first_match(
            rules.into_iter().map(Ok::<_, std::convert::Infallible>),
            &MatchCriteria::new(amount, None, None),
        )
        .unwrap()
    }

    #[test]
    fn test_first_match_respects_order() {
        let mut rules = vec![amount_rule(None, None, 5), amount_rule(None, None, 1)];
        sort_for_evaluation(&mut rules);
        let hit = scan(rules, 42).unwrap();
        assert_eq!(hit.priority, 1);
    }

    #[test]
    fn test_first_match_none() {
        let rules = vec![amount_rule(Some(100), Some(200), 1)];
        assert!(scan(rules, 500).is_none());
    }

    #[test]
    fn test_first_match_stops_at_error() {
        let rules = vec![Err("bad row"), Ok(amount_rule(None, None, 1))];
        let result = first_match(rules, &MatchCriteria::new(1, None, None));
        assert_eq!(result.unwrap_err(), "bad row");
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let rule = amount_rule(Some(500), Some(100), 1);
        assert!(matches!(
            rule.validate(),
            Err(ApprovalError::InvalidInput { field, .. }) if field == "min_amount"
        ));
    }

    #[test]
    fn test_validate_rejects_negative_bound() {
        let rule = amount_rule(Some(-1), None, 1);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_gap_in_steps() {
        let mut rule = amount_rule(None, None, 1);
        rule.steps = vec![RuleStep::new(1, "A", true), RuleStep::new(3, "B", true)];
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_unordered_contiguous_steps() {
        let mut rule = amount_rule(None, None, 1);
        rule.steps = vec![RuleStep::new(2, "B", true), RuleStep::new(1, "A", true)];
        assert!(rule.validate().is_ok());
        let ordered = rule.ordered_steps();
        assert_eq!(ordered[0].role, "A");
        assert_eq!(ordered[1].role, "B");
    }

    #[test]
    fn test_validate_vendor_rule_needs_vendor() {
        let rule = ApprovalRule::new(
            "ent-1",
            "v",
            RuleType::VendorBased,
            vec![RuleStep::new(1, "A", true)],
            1,
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_step_serde_uses_step_key() {
        let json = serde_json::json!([{ "step": 1, "role": "CLERK", "required": true }]);
        let steps: Vec<RuleStep> = serde_json::from_value(json).unwrap();
        assert_eq!(steps[0], RuleStep::new(1, "CLERK", true));
        let no_flag: RuleStep =
            serde_json::from_value(serde_json::json!({ "step": 2, "role": "CFO" })).unwrap();
        assert!(no_flag.required);
    }
}
