use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    evaluation::{EvaluationDetails, EvaluationRecord, SecondaryExposure},
    value::{lookup, ParamValue},
};

/// A feature gate evaluated for the current user.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureGate {
    /// Unhashed gate name.
    pub name: String,
    /// `false` for unknown gates.
    pub value: bool,
    /// Rule that produced `value`. Empty for unknown gates.
    pub rule_id: String,
    /// Where the value came from.
    pub details: EvaluationDetails,
    /// Gates evaluated on the way to `value`.
    pub secondary_exposures: Vec<SecondaryExposure>,
}

impl FeatureGate {
    pub(crate) fn new(name: &str, record: &EvaluationRecord, details: EvaluationDetails) -> FeatureGate {
        FeatureGate {
            name: name.to_owned(),
            value: record.gate_value(),
            rule_id: record.rule_id.clone(),
            details,
            secondary_exposures: record.secondary_exposures.clone(),
        }
    }
}

/// A dynamic config or experiment evaluated for the current user.
///
/// Unlike [`Layer`](crate::Layer), reading parameters never logs exposures: the exposure is
/// logged once, when the config is fetched from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicConfig {
    name: String,
    record: Arc<EvaluationRecord>,
    details: EvaluationDetails,
}

impl DynamicConfig {
    pub(crate) fn new(
        name: &str,
        record: Arc<EvaluationRecord>,
        details: EvaluationDetails,
    ) -> DynamicConfig {
        DynamicConfig {
            name: name.to_owned(),
            record,
            details,
        }
    }

    /// Unhashed config name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rule that produced the value. Empty for unknown configs.
    pub fn rule_id(&self) -> &str {
        &self.record.rule_id
    }

    /// Where the value came from.
    pub fn evaluation_details(&self) -> EvaluationDetails {
        self.details
    }

    /// Gates evaluated on the way to the value.
    pub fn secondary_exposures(&self) -> &[SecondaryExposure] {
        &self.record.secondary_exposures
    }

    /// `true` if the user is allocated to an experiment group.
    pub fn is_user_in_experiment(&self) -> bool {
        self.record.is_user_in_experiment
    }

    /// `true` while the experiment is running.
    pub fn is_experiment_active(&self) -> bool {
        self.record.is_experiment_active
    }

    /// All parameters. Empty if the config is unknown.
    pub fn value(&self) -> Map<String, Value> {
        self.record.parameters().cloned().unwrap_or_default()
    }

    /// Read `key`, returning `default` if it is absent or of a different type.
    pub fn get<T: ParamValue>(&self, key: &str, default: T) -> T {
        lookup(self.record.parameters(), key, None).unwrap_or(default)
    }

    /// Like [`get`](Self::get), but the raw value must also satisfy `guard`.
    pub fn get_with<T: ParamValue>(
        &self,
        key: &str,
        default: T,
        guard: impl Fn(&Value) -> bool,
    ) -> T {
        lookup(self.record.parameters(), key, Some(&guard)).unwrap_or(default)
    }

    /// Raw value of `key`, if present and not null.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        lookup(self.record.parameters(), key, None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::evaluation::{EvaluationKind, EvaluationReason};

    fn config() -> DynamicConfig {
        let record: EvaluationRecord = serde_json::from_value(json!({
            "name": "c",
            "rule_id": "rule",
            "value": {"str": "s", "list": [1, 2], "nested": {"k": true}},
            "is_user_in_experiment": true
        }))
        .unwrap();
        DynamicConfig::new(
            "c",
            Arc::new(record),
            EvaluationDetails::new(EvaluationReason::Network, 9),
        )
    }

    #[test]
    fn typed_reads() {
        let config = config();

        assert_eq!(config.get("str", String::new()), "s");
        assert_eq!(config.get("list", Vec::<i64>::new()), vec![1, 2]);
        assert_eq!(config.get("str", 0i64), 0);
        assert_eq!(config.get("list", Map::new()), Map::new());
        assert_eq!(config.get_with("str", "d".to_owned(), |v| v.is_number()), "d");
        assert_eq!(config.get_value("nested"), Some(json!({"k": true})));
        assert!(config.is_user_in_experiment());
        assert!(!config.is_experiment_active());
    }

    #[test]
    fn unrecognized_config_is_empty() {
        let config = DynamicConfig::new(
            "unknown",
            Arc::new(EvaluationRecord::unrecognized(EvaluationKind::Config, "unknown")),
            EvaluationDetails::new(EvaluationReason::Unrecognized, 0),
        );

        assert!(config.value().is_empty());
        assert_eq!(config.rule_id(), "");
        assert_eq!(config.get("anything", 2.5), 2.5);
    }
}
