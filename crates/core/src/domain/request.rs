use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tier::{TriggerType, WorkflowCategory};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn system() -> Self {
        Self("system".to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Number(Decimal),
    Text(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute `{attribute}` expects a number, got `{value}`")]
    ExpectedNumber { attribute: String, value: String },
    #[error("attribute `{attribute}` expects text, got `{value}`")]
    ExpectedText { attribute: String, value: String },
}

/// Request attributes keyed by the trigger they can be matched against.
///
/// Keys outside [`TriggerType`] are dropped when parsing inbound payloads; known keys
/// must carry a value of the right shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestAttributes {
    values: BTreeMap<TriggerType, AttributeValue>,
}

impl RequestAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_number(mut self, trigger: TriggerType, value: Decimal) -> Self {
        self.values.insert(trigger, AttributeValue::Number(value));
        self
    }

    pub fn with_text(mut self, trigger: TriggerType, value: impl Into<String>) -> Self {
        self.values.insert(trigger, AttributeValue::Text(value.into()));
        self
    }

    pub fn insert(&mut self, trigger: TriggerType, value: AttributeValue) {
        self.values.insert(trigger, value);
    }

    pub fn get(&self, trigger: TriggerType) -> Option<&AttributeValue> {
        self.values.get(&trigger)
    }

    pub fn contains(&self, trigger: TriggerType) -> bool {
        self.values.contains_key(&trigger)
    }

    pub fn number(&self, trigger: TriggerType) -> Option<Decimal> {
        match self.values.get(&trigger) {
            Some(AttributeValue::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn text(&self, trigger: TriggerType) -> Option<&str> {
        match self.values.get(&trigger) {
            Some(AttributeValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn amount(&self) -> Option<Decimal> {
        self.number(TriggerType::Amount)
    }

    pub fn from_json_map(
        raw: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, AttributeError> {
        let mut attributes = Self::new();

        for (key, value) in raw {
            let Ok(trigger) = key.parse::<TriggerType>() else {
                continue;
            };

            let parsed = if trigger.expects_number() {
                AttributeValue::Number(json_number(key, value)?)
            } else {
                match value {
                    serde_json::Value::String(text) => AttributeValue::Text(text.clone()),
                    other => {
                        return Err(AttributeError::ExpectedText {
                            attribute: key.clone(),
                            value: other.to_string(),
                        })
                    }
                }
            };
            attributes.insert(trigger, parsed);
        }

        Ok(attributes)
    }
}

fn json_number(key: &str, value: &serde_json::Value) -> Result<Decimal, AttributeError> {
    let mismatch =
        || AttributeError::ExpectedNumber { attribute: key.to_string(), value: value.to_string() };

    match value {
        serde_json::Value::Number(number) => {
            Decimal::from_str(&number.to_string()).map_err(|_| mismatch())
        }
        serde_json::Value::String(text) => Decimal::from_str(text.trim()).map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}

/// Everything eligibility needs to know about the request being decided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub requester_id: UserId,
    pub category: WorkflowCategory,
    pub attributes: RequestAttributes,
    #[serde(default)]
    pub tier_level: u8,
    #[serde(default)]
    pub dynamic_approvers: BTreeMap<String, Vec<UserId>>,
}

impl RequestContext {
    pub fn new(
        requester_id: UserId,
        category: WorkflowCategory,
        attributes: RequestAttributes,
    ) -> Self {
        Self {
            requester_id,
            category,
            attributes,
            tier_level: 0,
            dynamic_approvers: BTreeMap::new(),
        }
    }

    pub fn at_tier(&self, tier_level: u8) -> Self {
        Self { tier_level, ..self.clone() }
    }

    pub fn amount(&self) -> Option<Decimal> {
        self.attributes.amount()
    }

    pub fn department(&self) -> Option<&str> {
        self.attributes.text(TriggerType::Department)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{AttributeError, RequestAttributes};
    use crate::domain::tier::TriggerType;

    #[test]
    fn json_map_parses_known_triggers_and_ignores_unknown_keys() {
        let raw = json!({
            "amount": 6000,
            "urgency": "critical",
            "vendor_name": "Acme",
        });
        let attributes =
            RequestAttributes::from_json_map(raw.as_object().expect("object")).expect("parse");

        assert_eq!(attributes.amount(), Some(Decimal::new(6000, 0)));
        assert_eq!(attributes.text(TriggerType::Urgency), Some("critical"));
        assert!(!attributes.contains(TriggerType::Department));
    }

    #[test]
    fn json_map_accepts_numeric_strings_for_amounts() {
        let raw = json!({ "amount": "1250.50" });
        let attributes =
            RequestAttributes::from_json_map(raw.as_object().expect("object")).expect("parse");

        assert_eq!(attributes.amount(), Some(Decimal::new(125_050, 2)));
    }

    #[test]
    fn json_map_rejects_shape_mismatch() {
        let raw = json!({ "department": 12 });
        let error = RequestAttributes::from_json_map(raw.as_object().expect("object"))
            .expect_err("department must be text");

        assert!(matches!(error, AttributeError::ExpectedText { ref attribute, .. } if attribute == "department"));
    }
}
