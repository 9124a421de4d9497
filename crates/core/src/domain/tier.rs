use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::request::{AttributeValue, RequestAttributes, UserId};
use crate::errors::ApprovalError;

pub const MIN_TIER_LEVEL: u8 = 1;
pub const MAX_TIER_LEVEL: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    Purchase,
    TimeOff,
    Permit,
    Expense,
    Custom,
}

impl WorkflowCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::TimeOff => "time_off",
            Self::Permit => "permit",
            Self::Expense => "expense",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for WorkflowCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match normalize_key(value).as_str() {
            "purchase" => Ok(Self::Purchase),
            "time_off" => Ok(Self::TimeOff),
            "permit" => Ok(Self::Permit),
            "expense" => Ok(Self::Expense),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown workflow category `{other}`")),
        }
    }
}

/// Request attribute a threshold can be evaluated against.
///
/// Deserialization rejects anything else, so an unknown trigger fails when the
/// configuration is loaded rather than when a request is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Amount,
    Urgency,
    Category,
    Department,
    DurationDays,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Urgency => "urgency",
            Self::Category => "category",
            Self::Department => "department",
            Self::DurationDays => "duration_days",
        }
    }

    pub fn expects_number(&self) -> bool {
        matches!(self, Self::Amount | Self::DurationDays)
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match normalize_key(value).as_str() {
            "amount" => Ok(Self::Amount),
            "urgency" => Ok(Self::Urgency),
            "category" => Ok(Self::Category),
            "department" => Ok(Self::Department),
            "duration_days" => Ok(Self::DurationDays),
            other => Err(format!("unknown trigger type `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Between,
    InList,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ThresholdValue {
    Number(Decimal),
    NumberRange(Decimal, Decimal),
    Text(String),
    TextSet(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThreshold {
    pub trigger_type: TriggerType,
    pub operator: ThresholdOperator,
    pub value: ThresholdValue,
}

impl TierThreshold {
    /// A missing attribute never matches.
    pub fn matches(&self, attributes: &RequestAttributes) -> bool {
        use AttributeValue as A;
        use ThresholdOperator as Op;
        use ThresholdValue as V;

        let Some(actual) = attributes.get(self.trigger_type) else {
            return false;
        };

        match (self.operator, &self.value, actual) {
            (Op::Equals, V::Number(expected), A::Number(actual)) => actual == expected,
            (Op::Equals, V::Text(expected), A::Text(actual)) => {
                normalize_key(actual) == normalize_key(expected)
            }
            (Op::NotEquals, V::Number(expected), A::Number(actual)) => actual != expected,
            (Op::NotEquals, V::Text(expected), A::Text(actual)) => {
                normalize_key(actual) != normalize_key(expected)
            }
            (Op::GreaterThan, V::Number(expected), A::Number(actual)) => actual > expected,
            (Op::LessThan, V::Number(expected), A::Number(actual)) => actual < expected,
            (Op::Between, V::NumberRange(low, high), A::Number(actual)) => {
                low <= actual && actual <= high
            }
            (Op::InList, V::TextSet(candidates), A::Text(actual)) => {
                let actual = normalize_key(actual);
                candidates.iter().any(|candidate| normalize_key(candidate) == actual)
            }
            _ => false,
        }
    }

    fn shape_issue(&self) -> Option<String> {
        use ThresholdOperator as Op;
        use ThresholdValue as V;

        let trigger = self.trigger_type.as_str();
        let numeric = self.trigger_type.expects_number();

        match (self.operator, &self.value) {
            (Op::Equals | Op::NotEquals, V::Number(_)) if numeric => None,
            (Op::Equals | Op::NotEquals, V::Text(_)) if !numeric => None,
            (Op::GreaterThan | Op::LessThan, V::Number(_)) if numeric => None,
            (Op::Between, V::NumberRange(low, high)) if numeric => (low > high)
                .then(|| format!("`between` range on `{trigger}` has low bound above high bound")),
            (Op::InList, V::TextSet(values)) if !numeric => values
                .is_empty()
                .then(|| format!("`in_list` on `{trigger}` needs at least one value")),
            (operator, value) => Some(format!(
                "operator `{operator:?}` with value `{value:?}` cannot be evaluated against `{trigger}`"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    Role,
    User,
    Manager,
    DepartmentHead,
    Executive,
    Dynamic,
}

impl ApproverType {
    fn needs_identifier(&self) -> bool {
        matches!(self, Self::Role | Self::User | Self::Dynamic)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierApprover {
    pub approver_type: ApproverType,
    /// User id, role name, or dynamic approver key depending on `approver_type`.
    #[serde(default)]
    pub approver_id: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(default = "default_true")]
    pub is_required: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproverLimit {
    pub can_approve_own_requests: bool,
    pub can_approve_direct_reports: bool,
    pub max_approval_amount: Option<Decimal>,
    pub max_approvals_per_day: Option<u32>,
}

impl Default for ApproverLimit {
    fn default() -> Self {
        Self {
            can_approve_own_requests: false,
            can_approve_direct_reports: true,
            max_approval_amount: None,
            max_approvals_per_day: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EscalationTarget {
    User(UserId),
    Tier(u8),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub timeout_hours: u32,
    #[serde(default)]
    pub escalate_to: Option<EscalationTarget>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTier {
    pub level: u8,
    pub name: String,
    #[serde(default)]
    pub category: Option<WorkflowCategory>,
    #[serde(default)]
    pub thresholds: Vec<TierThreshold>,
    pub approvers: Vec<TierApprover>,
    #[serde(default)]
    pub require_all_approvers: bool,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub auto_escalate_hours: Option<u32>,
    #[serde(default)]
    pub auto_approve_on_timeout: bool,
    #[serde(default)]
    pub escalation: Option<EscalationRule>,
    #[serde(default)]
    pub reminder_interval_hours: Option<u32>,
    #[serde(default)]
    pub approver_limits: ApproverLimit,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl ApprovalTier {
    pub fn matches(&self, attributes: &RequestAttributes, logic: ThresholdLogic) -> bool {
        if self.thresholds.is_empty() {
            return false;
        }

        match logic {
            ThresholdLogic::Any => self.thresholds.iter().any(|t| t.matches(attributes)),
            ThresholdLogic::All => self.thresholds.iter().all(|t| t.matches(attributes)),
        }
    }

    /// Step-level rule wins over the tier-wide `auto_escalate_hours`.
    pub fn escalation_timeout_hours(&self) -> Option<u32> {
        self.escalation.as_ref().map(|rule| rule.timeout_hours).or(self.auto_escalate_hours)
    }

    pub fn escalation_target(&self) -> Option<&EscalationTarget> {
        self.escalation.as_ref().and_then(|rule| rule.escalate_to.as_ref())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLogic {
    #[default]
    Any,
    All,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierInclusion {
    #[default]
    Cumulative,
    MatchedOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigurationId(pub String);

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfiguration {
    pub id: ConfigurationId,
    pub name: String,
    pub category: WorkflowCategory,
    #[serde(default = "default_version")]
    pub version: u32,
    pub tiers: Vec<ApprovalTier>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub threshold_logic: ThresholdLogic,
    #[serde(default)]
    pub tier_inclusion: TierInclusion,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TierConfiguration {
    pub fn tier(&self, level: u8) -> Option<&ApprovalTier> {
        self.tiers.iter().find(|tier| tier.level == level)
    }

    pub fn validate(&self) -> Result<(), ApprovalError> {
        let invalid = |reason: String| ApprovalError::InvalidConfiguration {
            configuration_id: self.id.clone(),
            reason,
        };

        if self.id.0.trim().is_empty() {
            return Err(invalid("configuration id must not be empty".to_string()));
        }
        if self.version == 0 {
            return Err(invalid("version must start at 1".to_string()));
        }
        if self.tiers.is_empty() {
            return Err(invalid("at least one tier is required".to_string()));
        }

        let mut seen_levels = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            if !(MIN_TIER_LEVEL..=MAX_TIER_LEVEL).contains(&tier.level) {
                return Err(invalid(format!(
                    "tier `{}` has level {} outside {MIN_TIER_LEVEL}..={MAX_TIER_LEVEL}",
                    tier.name, tier.level
                )));
            }
            if seen_levels.contains(&tier.level) {
                return Err(invalid(format!("tier level {} is declared twice", tier.level)));
            }
            seen_levels.push(tier.level);

            if let Some(category) = tier.category {
                if category != self.category {
                    return Err(invalid(format!(
                        "tier {} declares category `{category}` inside a `{}` configuration",
                        tier.level, self.category
                    )));
                }
            }

            if tier.approvers.is_empty() {
                return Err(invalid(format!("tier {} has no approvers", tier.level)));
            }
            for approver in &tier.approvers {
                let missing_id = approver
                    .approver_id
                    .as_deref()
                    .map(|id| id.trim().is_empty())
                    .unwrap_or(true);
                if approver.approver_type.needs_identifier() && missing_id {
                    return Err(invalid(format!(
                        "tier {} has a `{:?}` approver without approver_id",
                        tier.level, approver.approver_type
                    )));
                }
            }

            for threshold in &tier.thresholds {
                if let Some(issue) = threshold.shape_issue() {
                    return Err(invalid(format!("tier {}: {issue}", tier.level)));
                }
            }

            if let Some(rule) = &tier.escalation {
                if rule.timeout_hours == 0 {
                    return Err(invalid(format!(
                        "tier {} escalation timeout_hours must be greater than zero",
                        tier.level
                    )));
                }
                if let Some(EscalationTarget::Tier(target)) = rule.escalate_to {
                    if target <= tier.level || self.tier(target).is_none() {
                        return Err(invalid(format!(
                            "tier {} escalates to tier {target}, which is not a higher configured tier",
                            tier.level
                        )));
                    }
                }
            }

            if tier.auto_escalate_hours == Some(0) {
                return Err(invalid(format!(
                    "tier {} auto_escalate_hours must be greater than zero",
                    tier.level
                )));
            }
            if tier.auto_approve_on_timeout && tier.escalation_timeout_hours().is_none() {
                return Err(invalid(format!(
                    "tier {} auto-approves on timeout but has no timeout configured",
                    tier.level
                )));
            }
        }

        Ok(())
    }
}

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{
        ApprovalTier, ApproverLimit, ApproverType, ConfigurationId, EscalationRule,
        EscalationTarget, ThresholdLogic, ThresholdOperator, ThresholdValue, TierApprover,
        TierConfiguration, TierInclusion, TierThreshold, TriggerType, WorkflowCategory,
    };
    use crate::domain::request::RequestAttributes;
    use crate::errors::ApprovalError;

    fn threshold(
        trigger_type: TriggerType,
        operator: ThresholdOperator,
        value: ThresholdValue,
    ) -> TierThreshold {
        TierThreshold { trigger_type, operator, value }
    }

    fn tier(level: u8, thresholds: Vec<TierThreshold>) -> ApprovalTier {
        ApprovalTier {
            level,
            name: format!("Tier {level}"),
            category: None,
            thresholds,
            approvers: vec![TierApprover {
                approver_type: ApproverType::User,
                approver_id: Some(format!("u-tier-{level}")),
                order: 0,
                is_required: true,
            }],
            require_all_approvers: false,
            sequential: false,
            auto_escalate_hours: None,
            auto_approve_on_timeout: false,
            escalation: None,
            reminder_interval_hours: None,
            approver_limits: ApproverLimit::default(),
            is_active: true,
        }
    }

    fn configuration(tiers: Vec<ApprovalTier>) -> TierConfiguration {
        TierConfiguration {
            id: ConfigurationId("cfg-purchase".to_string()),
            name: "Purchase approvals".to_string(),
            category: WorkflowCategory::Purchase,
            version: 1,
            tiers,
            is_default: true,
            is_active: true,
            threshold_logic: ThresholdLogic::Any,
            tier_inclusion: TierInclusion::Cumulative,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn between_uses_inclusive_bounds() {
        let between = threshold(
            TriggerType::Amount,
            ThresholdOperator::Between,
            ThresholdValue::NumberRange(Decimal::new(1000, 0), Decimal::new(5000, 0)),
        );

        for (amount, expected) in [(999, false), (1000, true), (5000, true), (5001, false)] {
            let attributes =
                RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(amount, 0));
            assert_eq!(between.matches(&attributes), expected, "amount {amount}");
        }
    }

    #[test]
    fn text_comparisons_ignore_case_and_whitespace() {
        let in_list = threshold(
            TriggerType::Department,
            ThresholdOperator::InList,
            ThresholdValue::TextSet(vec!["Finance".to_string(), "Legal".to_string()]),
        );
        let attributes = RequestAttributes::new().with_text(TriggerType::Department, " legal ");

        assert!(in_list.matches(&attributes));
    }

    #[test]
    fn missing_attribute_never_matches_even_for_not_equals() {
        let not_equals = threshold(
            TriggerType::Urgency,
            ThresholdOperator::NotEquals,
            ThresholdValue::Text("low".to_string()),
        );

        assert!(!not_equals.matches(&RequestAttributes::new()));
    }

    #[test]
    fn all_logic_requires_every_threshold() {
        let both = tier(
            2,
            vec![
                threshold(
                    TriggerType::Amount,
                    ThresholdOperator::GreaterThan,
                    ThresholdValue::Number(Decimal::new(1000, 0)),
                ),
                threshold(
                    TriggerType::Urgency,
                    ThresholdOperator::Equals,
                    ThresholdValue::Text("critical".to_string()),
                ),
            ],
        );
        let attributes =
            RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(2000, 0));

        assert!(both.matches(&attributes, ThresholdLogic::Any));
        assert!(!both.matches(&attributes, ThresholdLogic::All));
    }

    #[test]
    fn validation_rejects_duplicate_levels() {
        let config = configuration(vec![tier(2, vec![]), tier(2, vec![])]);
        let error = config.validate().expect_err("duplicate levels must fail");

        assert!(matches!(
            error,
            ApprovalError::InvalidConfiguration { ref reason, .. } if reason.contains("declared twice")
        ));
    }

    #[test]
    fn validation_rejects_numeric_operator_on_text_trigger() {
        let config = configuration(vec![tier(
            1,
            vec![threshold(
                TriggerType::Urgency,
                ThresholdOperator::GreaterThan,
                ThresholdValue::Number(Decimal::ONE),
            )],
        )]);

        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_escalation_to_lower_tier() {
        let mut upper = tier(3, vec![]);
        upper.escalation = Some(EscalationRule {
            timeout_hours: 24,
            escalate_to: Some(EscalationTarget::Tier(1)),
        });
        let config = configuration(vec![tier(1, vec![]), upper]);

        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_trigger_type_fails_at_load_time() {
        let raw = r#"{
            "trigger_type": "moon_phase",
            "operator": "equals",
            "value": { "kind": "text", "value": "full" }
        }"#;

        assert!(serde_json::from_str::<TierThreshold>(raw).is_err());
    }

    #[test]
    fn escalation_rule_timeout_overrides_tier_hours() {
        let mut with_rule = tier(1, vec![]);
        with_rule.auto_escalate_hours = Some(48);
        with_rule.escalation = Some(EscalationRule { timeout_hours: 8, escalate_to: None });

        assert_eq!(with_rule.escalation_timeout_hours(), Some(8));
    }
}
