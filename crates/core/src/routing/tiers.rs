use crate::domain::request::RequestAttributes;
use crate::domain::tier::{ApprovalTier, TierConfiguration, TierInclusion};
use crate::errors::ApprovalError;

/// Picks the tiers a request must pass. The configuration snapshot is always passed in;
/// nothing is looked up from shared state.
#[derive(Clone, Copy, Debug, Default)]
pub struct TierResolver;

impl TierResolver {
    pub fn resolve(
        &self,
        config: &TierConfiguration,
        attributes: &RequestAttributes,
    ) -> Result<Vec<ApprovalTier>, ApprovalError> {
        let mut active: Vec<&ApprovalTier> = config.tiers.iter().filter(|t| t.is_active).collect();
        active.sort_by_key(|tier| tier.level);

        let matched: Vec<u8> = active
            .iter()
            .filter(|tier| tier.matches(attributes, config.threshold_logic))
            .map(|tier| tier.level)
            .collect();

        let Some(highest) = matched.iter().copied().max() else {
            tracing::debug!(
                event_name = "routing.no_tier_matched",
                configuration_id = %config.id,
                version = config.version,
                "no tier thresholds matched request attributes"
            );
            return Err(ApprovalError::NoTierMatched {
                configuration_id: config.id.clone(),
                category: config.category,
            });
        };

        let tiers = active
            .into_iter()
            .filter(|tier| match config.tier_inclusion {
                TierInclusion::Cumulative => tier.level <= highest,
                TierInclusion::MatchedOnly => matched.contains(&tier.level),
            })
            .cloned()
            .collect();

        Ok(tiers)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::TierResolver;
    use crate::domain::request::RequestAttributes;
    use crate::domain::tier::{
        ApprovalTier, ApproverLimit, ApproverType, ConfigurationId, ThresholdLogic,
        ThresholdOperator, ThresholdValue, TierApprover, TierConfiguration, TierInclusion,
        TierThreshold, TriggerType, WorkflowCategory,
    };
    use crate::errors::ApprovalError;

    fn threshold(
        trigger_type: TriggerType,
        operator: ThresholdOperator,
        value: ThresholdValue,
    ) -> TierThreshold {
        TierThreshold { trigger_type, operator, value }
    }

    fn amount_over(value: i64) -> TierThreshold {
        threshold(
            TriggerType::Amount,
            ThresholdOperator::GreaterThan,
            ThresholdValue::Number(Decimal::new(value, 0)),
        )
    }

    fn tier(level: u8, thresholds: Vec<TierThreshold>) -> ApprovalTier {
        ApprovalTier {
            level,
            name: format!("Tier {level}"),
            category: None,
            thresholds,
            approvers: vec![TierApprover {
                approver_type: ApproverType::Manager,
                approver_id: None,
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

    fn config(category: WorkflowCategory, tiers: Vec<ApprovalTier>) -> TierConfiguration {
        TierConfiguration {
            id: ConfigurationId(format!("{category}-default")),
            name: "default".to_string(),
            category,
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

    fn amount(value: i64) -> RequestAttributes {
        RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(value, 0))
    }

    fn levels(tiers: &[ApprovalTier]) -> Vec<u8> {
        tiers.iter().map(|tier| tier.level).collect()
    }

    #[test]
    fn purchase_over_five_thousand_routes_through_tiers_two_and_three() {
        let config = config(
            WorkflowCategory::Purchase,
            vec![tier(3, vec![amount_over(5000)]), tier(2, vec![amount_over(1000)])],
        );

        let tiers = TierResolver.resolve(&config, &amount(6000)).expect("tiers resolve");

        assert_eq!(levels(&tiers), vec![2, 3]);
    }

    #[test]
    fn cumulative_inclusion_pulls_in_lower_unmatched_tiers() {
        let urgent = threshold(
            TriggerType::Urgency,
            ThresholdOperator::Equals,
            ThresholdValue::Text("critical".to_string()),
        );
        let config = config(
            WorkflowCategory::Purchase,
            vec![tier(1, vec![amount_over(100)]), tier(2, vec![amount_over(1000)]), tier(3, vec![urgent])],
        );
        let attributes = amount(50).with_text(TriggerType::Urgency, "Critical");

        let tiers = TierResolver.resolve(&config, &attributes).expect("tiers resolve");

        assert_eq!(levels(&tiers), vec![1, 2, 3]);
    }

    #[test]
    fn matched_only_inclusion_keeps_just_the_matching_tiers() {
        let mut config = config(
            WorkflowCategory::Purchase,
            vec![tier(1, vec![amount_over(100)]), tier(2, vec![amount_over(1000)]), tier(3, vec![amount_over(5000)])],
        );
        config.tier_inclusion = TierInclusion::MatchedOnly;
        config.tiers[0].thresholds = vec![threshold(
            TriggerType::Amount,
            ThresholdOperator::LessThan,
            ThresholdValue::Number(Decimal::new(100, 0)),
        )];

        let tiers = TierResolver.resolve(&config, &amount(6000)).expect("tiers resolve");

        assert_eq!(levels(&tiers), vec![2, 3]);
    }

    #[test]
    fn time_off_without_matching_threshold_is_an_error_not_an_approval() {
        let config = config(WorkflowCategory::TimeOff, vec![tier(1, vec![amount_over(1000)])]);
        let attributes =
            RequestAttributes::new().with_number(TriggerType::DurationDays, Decimal::new(3, 0));

        let error = TierResolver.resolve(&config, &attributes).expect_err("nothing matches");

        assert!(matches!(
            error,
            ApprovalError::NoTierMatched { category: WorkflowCategory::TimeOff, .. }
        ));
    }

    #[test]
    fn inactive_tiers_are_never_returned() {
        let mut config = config(
            WorkflowCategory::Purchase,
            vec![tier(1, vec![amount_over(100)]), tier(2, vec![amount_over(1000)])],
        );
        config.tiers[1].is_active = false;

        let tiers = TierResolver.resolve(&config, &amount(6000)).expect("tiers resolve");

        assert_eq!(levels(&tiers), vec![1]);
    }

    #[test]
    fn all_logic_requires_every_threshold() {
        let mut config = config(
            WorkflowCategory::Permit,
            vec![tier(
                1,
                vec![
                    amount_over(1000),
                    threshold(
                        TriggerType::Department,
                        ThresholdOperator::InList,
                        ThresholdValue::TextSet(vec!["facilities".to_string()]),
                    ),
                ],
            )],
        );
        config.threshold_logic = ThresholdLogic::All;

        assert!(TierResolver.resolve(&config, &amount(2000)).is_err());
        let both = amount(2000).with_text(TriggerType::Department, "Facilities");
        assert_eq!(levels(&TierResolver.resolve(&config, &both).expect("resolves")), vec![1]);
    }

    #[test]
    fn resolution_is_deterministic() {
        let config = config(
            WorkflowCategory::Purchase,
            vec![tier(2, vec![amount_over(1000)]), tier(1, vec![amount_over(10)])],
        );
        let attributes = amount(1500);

        let first = TierResolver.resolve(&config, &attributes).expect("resolves");
        let second = TierResolver.resolve(&config, &attributes).expect("resolves");

        assert_eq!(first, second);
    }
}
