//! Evaluation records as computed by the server, and the payload they arrive in.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnError, DefaultOnNull};

use crate::hashing::{djb2_hash, sha256_hash};

/// Kind of entity being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationKind {
    /// Feature gate (boolean).
    #[display("gate")]
    Gate,
    /// Dynamic config.
    #[display("config")]
    Config,
    /// Experiment. Stored alongside dynamic configs but eligible for sticky bucketing.
    #[display("experiment")]
    Experiment,
    /// Layer.
    #[display("layer")]
    Layer,
}

/// Why an evaluation has the value it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum EvaluationReason {
    /// Values came from caller-supplied initialize values.
    Bootstrap,
    /// Values came from the persisted cache.
    Cache,
    /// Values came from a network response with updates.
    Network,
    /// Server reported no changes since the last update time; cached values are current.
    NetworkNotModified,
    /// A device-pinned experiment value was served.
    Sticky,
    /// A local override was served.
    LocalOverride,
    /// The store is loaded but has no record with this name.
    Unrecognized,
    /// No values have been applied for the current user.
    Uninitialized,
    /// The read failed and a fallback value was served.
    Error,
}

/// Reason and timestamp (epoch millis) attached to every evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationDetails {
    /// Source of the value.
    pub reason: EvaluationReason,
    /// Last update time of the values the record was served from.
    pub time: i64,
}

impl EvaluationDetails {
    /// Pair `reason` with `time`.
    pub fn new(reason: EvaluationReason, time: i64) -> EvaluationDetails {
        EvaluationDetails { reason, time }
    }
}

/// Provenance of an upstream gate that influenced an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecondaryExposure {
    /// Gate name.
    pub gate: String,
    /// `"true"` or `"false"`.
    #[serde(rename = "gateValue")]
    pub gate_value: String,
    /// Rule of the gate that matched.
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}

/// A single server-computed evaluation.
///
/// `value` is a boolean for gates and a JSON object for configs, experiments, and layers.
/// Records are immutable once stored and replaced wholesale by the next save.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Name as it appears in the payload (usually hashed).
    #[serde(default)]
    pub name: String,
    /// Rule that matched for the user.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub rule_id: String,
    /// Gate value or parameter object.
    #[serde(default)]
    pub value: serde_json::Value,
    /// `true` if the user is allocated to an experiment group.
    #[serde(default)]
    pub is_user_in_experiment: bool,
    /// `true` while the experiment is running.
    #[serde(default)]
    pub is_experiment_active: bool,
    /// Layers only: experiment the user is allocated to within the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<String>,
    /// Gates evaluated on the way to `value`.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// Layers only: exposures logged for parameters not owned by the allocated experiment.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    /// Layers only: parameters owned by the allocated experiment.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub explicit_parameters: BTreeSet<String>,
}

impl EvaluationRecord {
    /// Record returned when nothing is known about `name`: empty value and empty rule ID.
    pub fn unrecognized(kind: EvaluationKind, name: &str) -> EvaluationRecord {
        EvaluationRecord::with_value(kind, name, "", empty_value(kind))
    }

    /// Record carrying a locally supplied value.
    pub(crate) fn with_value(
        kind: EvaluationKind,
        name: &str,
        rule_id: &str,
        value: serde_json::Value,
    ) -> EvaluationRecord {
        debug_assert!(kind != EvaluationKind::Gate || value.is_boolean());
        EvaluationRecord {
            name: name.to_owned(),
            rule_id: rule_id.to_owned(),
            value,
            is_user_in_experiment: false,
            is_experiment_active: false,
            allocated_experiment_name: None,
            secondary_exposures: Vec::new(),
            undelegated_secondary_exposures: Vec::new(),
            explicit_parameters: BTreeSet::new(),
        }
    }

    /// Whether the record may be pinned to the device as a sticky value.
    pub fn is_sticky_eligible(&self) -> bool {
        self.is_user_in_experiment && self.is_experiment_active
    }

    /// Gate value. Anything but `true` reads as `false`.
    pub fn gate_value(&self) -> bool {
        self.value.as_bool().unwrap_or(false)
    }

    /// Parameter map of a config, experiment, or layer. Non-object values read as empty.
    pub fn parameters(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.value.as_object()
    }
}

fn empty_value(kind: EvaluationKind) -> serde_json::Value {
    match kind {
        EvaluationKind::Gate => serde_json::Value::Bool(false),
        EvaluationKind::Config | EvaluationKind::Experiment | EvaluationKind::Layer => {
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}

/// How names are hashed in a payload. Reported by the server as `hash_used`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Unsigned 32-bit rolling hash, see [`djb2_hash`].
    Djb2,
    /// Base64 SHA-256, see [`sha256_hash`].
    #[default]
    Sha256,
    /// Names are sent in plain text.
    None,
}

impl HashAlgorithm {
    /// `name` as it appears in a payload hashed with this algorithm.
    pub fn hash(self, name: &str) -> String {
        match self {
            HashAlgorithm::Djb2 => djb2_hash(name),
            HashAlgorithm::Sha256 => sha256_hash(name),
            HashAlgorithm::None => name.to_owned(),
        }
    }
}

/// `TryParse` allows a single record to fail parsing without failing the parsing of the whole
/// payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

/// Response of the initialize endpoint, also accepted as bootstrap values.
#[serde_as]
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct InitializeResponse {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub feature_gates: HashMap<String, TryParse<EvaluationRecord>>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub dynamic_configs: HashMap<String, TryParse<EvaluationRecord>>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub layer_configs: HashMap<String, TryParse<EvaluationRecord>>,
    #[serde(default)]
    pub has_updates: bool,
    #[serde(default)]
    pub is_no_content: bool,
    #[serde(default)]
    pub time: i64,
    /// Unknown algorithms read as the default.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub hash_used: HashAlgorithm,
}

/// Drop records that failed to parse, logging each one.
pub(crate) fn compile_records(
    section: &str,
    records: HashMap<String, TryParse<EvaluationRecord>>,
) -> HashMap<String, EvaluationRecord> {
    records
        .into_iter()
        .filter_map(|(name, record)| match record {
            TryParse::Parsed(record) => Some((name, record)),
            TryParse::ParseFailed(_) => {
                log::warn!(target: "statsig", section = section, name:display = name; "dropping record that failed to parse");
                None
            }
        })
        .collect()
}
