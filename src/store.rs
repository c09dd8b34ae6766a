//! In-memory owner of every cached evaluation: one [`CacheRow`] per recently seen identity,
//! device-sticky experiment values, and local overrides.
//!
//! The store never performs I/O. Callers feed it payloads ([`EvaluationStore::save`],
//! [`EvaluationStore::bootstrap`], [`EvaluationStore::load_persisted`]) and persist
//! [`EvaluationStore::persisted_snapshot`] themselves. All reads are synchronous.
//!
//! Reads are two-phase. [`EvaluationStore::resolve`] never mutates and reports whether the
//! resolved record should be pinned as a sticky value; [`EvaluationStore::commit_sticky`] performs
//! the pinning. [`EvaluationStore::resolve_mut`] runs both.
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DefaultOnError};

use crate::{
    clock::Clock,
    evaluation::{
        compile_records, EvaluationDetails, EvaluationKind, EvaluationReason, EvaluationRecord,
        HashAlgorithm, InitializeResponse,
    },
    hashing::{sha256_hash, UserCacheKey},
    Error, Result,
};

/// Number of identity rows retained. The least recently updated rows are evicted first.
pub const MAX_CACHED_ROWS: usize = 10;

/// Rule ID reported for locally overridden values.
const OVERRIDE_RULE_ID: &str = "override";

type Records = HashMap<String, Arc<EvaluationRecord>>;

/// Cached evaluations of a single identity, as persisted.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    /// Gates keyed by hashed name.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub feature_gates: Records,
    /// Dynamic configs and experiments keyed by hashed name.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub dynamic_configs: Records,
    /// Layers keyed by hashed name.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub layer_configs: Records,
    /// Device-pinned experiment and layer values, keyed by SHA-256 of the name regardless of
    /// `hash_used`.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub sticky_values: Records,
    /// Server time of the last update applied to this row. Never decreases.
    #[serde(default)]
    pub time: i64,
    /// Hash of the full user object the row was fetched for.
    #[serde(default)]
    pub user_hash: String,
    /// How record names are hashed.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub hash_used: HashAlgorithm,
}

impl CacheRow {
    /// `true` if the row carries no fetched evaluations.
    pub fn is_empty(&self) -> bool {
        self.feature_gates.is_empty() && self.dynamic_configs.is_empty() && self.layer_configs.is_empty()
    }

    fn records(&self, kind: EvaluationKind) -> &Records {
        match kind {
            EvaluationKind::Gate => &self.feature_gates,
            EvaluationKind::Config | EvaluationKind::Experiment => &self.dynamic_configs,
            EvaluationKind::Layer => &self.layer_configs,
        }
    }

    /// Record of `name`, looked up by its hashed form, then by the plain name.
    fn record(&self, kind: EvaluationKind, name: &str) -> Option<&Arc<EvaluationRecord>> {
        let records = self.records(kind);
        records
            .get(&self.hash_used.hash(name))
            .or_else(|| records.get(name))
    }

    fn replace_records(&mut self, response: InitializeResponse) {
        self.hash_used = response.hash_used;
        self.feature_gates = into_records("feature_gates", response.feature_gates);
        self.dynamic_configs = into_records("dynamic_configs", response.dynamic_configs);
        self.layer_configs = into_records("layer_configs", response.layer_configs);
        self.advance_time(response.time);
    }

    fn advance_time(&mut self, time: i64) {
        if time < self.time {
            log::debug!(target: "statsig", row_time = self.time, payload_time = time; "keeping newer row time");
        }
        self.time = self.time.max(time);
    }
}

fn into_records(
    section: &str,
    records: HashMap<String, crate::evaluation::TryParse<EvaluationRecord>>,
) -> Records {
    compile_records(section, records)
        .into_iter()
        .map(|(name, record)| (name, Arc::new(record)))
        .collect()
}

/// Local overrides grouped by kind. Overrides are keyed by plain (unhashed) names and are never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsigOverrides {
    /// Gate values.
    pub gates: HashMap<String, bool>,
    /// Parameters of dynamic configs and experiments.
    pub configs: HashMap<String, Map<String, Value>>,
    /// Layer parameters.
    pub layers: HashMap<String, Map<String, Value>>,
}

/// Per-read flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Skip local overrides.
    pub ignore_overrides: bool,
    /// Serve and capture device-sticky values for experiments and layers.
    pub keep_device_value: bool,
}

/// Outcome of [`EvaluationStore::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Record to serve.
    pub record: Arc<EvaluationRecord>,
    /// Where the record came from.
    pub details: EvaluationDetails,
    /// The record should be pinned as a sticky value with [`EvaluationStore::commit_sticky`].
    pub capture_sticky: bool,
}

/// What [`EvaluationStore::save`] did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Records were replaced.
    Updated,
    /// Server reported no changes.
    NotModified,
    /// Payload carried neither updates nor a no-content marker.
    Unchanged,
}

/// Evaluations cached per identity, plus local overrides and sticky values.
///
/// Reads are served from the row of the active identity. Rows are persisted as a whole with
/// [`persisted_snapshot`](Self::persisted_snapshot).
pub struct EvaluationStore {
    rows: HashMap<String, CacheRow>,
    current_key: UserCacheKey,
    overrides: StatsigOverrides,
    overrides_disabled: bool,
    reason: EvaluationReason,
    loaded: bool,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl EvaluationStore {
    /// Create an empty, not yet loaded store for the identity `current_key`.
    pub fn new(current_key: UserCacheKey, clock: Arc<dyn Clock + Send + Sync>) -> EvaluationStore {
        EvaluationStore {
            rows: HashMap::new(),
            current_key,
            overrides: StatsigOverrides::default(),
            overrides_disabled: false,
            reason: EvaluationReason::Uninitialized,
            loaded: false,
            clock,
        }
    }

    /// Ignore all overrides, and refuse to record new ones.
    pub fn disable_overrides(&mut self) {
        self.overrides_disabled = true;
    }

    /// `true` once bootstrap, cache, or network values were applied (or a hydration attempt
    /// completed with nothing to apply).
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Mark the store as loaded without applying values.
    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Reason and time of the values currently served for the active identity.
    pub fn evaluation_details(&self) -> EvaluationDetails {
        EvaluationDetails::new(self.reason, self.current_time())
    }

    /// Cache key of the active identity.
    pub fn current_key(&self) -> &UserCacheKey {
        &self.current_key
    }

    /// Resolve `name` without mutating the store.
    ///
    /// Precedence: local override, sticky value, latest fetched record, unrecognized default.
    ///
    /// # Errors
    ///
    /// [`Error::NotLoaded`] if nothing has been applied yet, regardless of overrides.
    pub fn resolve(
        &self,
        kind: EvaluationKind,
        name: &str,
        options: ResolveOptions,
    ) -> Result<Resolution> {
        if !self.loaded {
            return Err(Error::NotLoaded);
        }

        if !options.ignore_overrides && !self.overrides_disabled {
            if let Some(record) = self.override_record(kind, name) {
                return Ok(Resolution {
                    record: Arc::new(record),
                    details: EvaluationDetails::new(
                        EvaluationReason::LocalOverride,
                        self.current_time(),
                    ),
                    capture_sticky: false,
                });
            }
        }

        let row = self.current_row();
        let hashed = sha256_hash(name);
        let sticky_kind = is_sticky_kind(kind);

        if sticky_kind && options.keep_device_value {
            if let Some(sticky) = row.and_then(|row| row.sticky_values.get(&hashed)) {
                return Ok(Resolution {
                    record: Arc::clone(sticky),
                    details: EvaluationDetails::new(EvaluationReason::Sticky, self.current_time()),
                    capture_sticky: false,
                });
            }
        }

        let latest = row.and_then(|row| row.record(kind, name));

        let resolution = match latest {
            Some(record) => Resolution {
                record: Arc::clone(record),
                details: EvaluationDetails::new(self.reason, self.current_time()),
                capture_sticky: sticky_kind
                    && options.keep_device_value
                    && record.is_sticky_eligible(),
            },
            None => {
                let reason = match self.reason {
                    EvaluationReason::Uninitialized => EvaluationReason::Uninitialized,
                    _ => EvaluationReason::Unrecognized,
                };
                Resolution {
                    record: Arc::new(EvaluationRecord::unrecognized(kind, name)),
                    details: EvaluationDetails::new(reason, self.current_time()),
                    capture_sticky: false,
                }
            }
        };

        log::trace!(target: "statsig", kind:display = kind, name = name, reason:display = resolution.details.reason; "resolved");
        Ok(resolution)
    }

    /// Pin the resolved record as the sticky value of `name` for the active identity.
    ///
    /// Existing sticky values are never replaced. Returns `true` if a value was captured.
    pub fn commit_sticky(&mut self, name: &str, resolution: &Resolution) -> bool {
        if !resolution.capture_sticky {
            return false;
        }

        let key = self.current_key.v1.clone();
        let row = self.rows.entry(key).or_default();
        let hashed = sha256_hash(name);
        if row.sticky_values.contains_key(&hashed) {
            return false;
        }

        log::debug!(target: "statsig", name = name, rule_id:display = resolution.record.rule_id; "captured sticky value");
        row.sticky_values
            .insert(hashed, Arc::clone(&resolution.record));
        true
    }

    /// [`resolve`](Self::resolve) followed by [`commit_sticky`](Self::commit_sticky). The second
    /// element is `true` if a sticky value was captured (and the store should be persisted).
    pub fn resolve_mut(
        &mut self,
        kind: EvaluationKind,
        name: &str,
        options: ResolveOptions,
    ) -> Result<(Resolution, bool)> {
        let resolution = self.resolve(kind, name, options)?;
        let captured = self.commit_sticky(name, &resolution);
        Ok((resolution, captured))
    }

    /// Remove the sticky value of `name` for the active identity.
    pub fn remove_sticky_value(&mut self, name: &str) -> bool {
        let hashed = sha256_hash(name);
        self.rows
            .get_mut(&self.current_key.v1)
            .is_some_and(|row| row.sticky_values.remove(&hashed).is_some())
    }

    /// Apply a network payload fetched for the identity `key`.
    ///
    /// With `has_updates`, the row's records are replaced wholesale. With `is_no_content`, records
    /// are left untouched. The store-wide reason only changes when `key` is the active identity.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPayload`] if the payload does not have the expected shape. Prior state is
    /// kept.
    pub fn save(&mut self, key: &UserCacheKey, user_hash: &str, payload: Value) -> Result<SaveOutcome> {
        let response: InitializeResponse = serde_json::from_value(payload)?;
        self.loaded = true;
        let is_current = *key == self.current_key;

        if response.has_updates {
            let row = self.row_mut(key);
            row.replace_records(response);
            row.user_hash = user_hash.to_owned();
            if is_current {
                self.reason = EvaluationReason::Network;
            }
            self.evict();
            log::debug!(target: "statsig", key:display = key.v1, is_current = is_current; "saved values");
            Ok(SaveOutcome::Updated)
        } else if response.is_no_content {
            if is_current {
                self.reason = EvaluationReason::NetworkNotModified;
            }
            Ok(SaveOutcome::NotModified)
        } else {
            log::debug!(target: "statsig", key:display = key.v1; "payload has no updates");
            Ok(SaveOutcome::Unchanged)
        }
    }

    /// Apply caller-supplied initialize values for the active identity.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPayload`] if the values do not have the expected shape.
    pub fn bootstrap(&mut self, user_hash: &str, payload: Value) -> Result<()> {
        let response: InitializeResponse = serde_json::from_value(payload)?;
        let key = self.current_key.clone();
        let row = self.row_mut(&key);
        row.replace_records(response);
        row.user_hash = user_hash.to_owned();
        self.reason = EvaluationReason::Bootstrap;
        self.loaded = true;
        self.evict();
        Ok(())
    }

    /// Merge rows read from persistent storage. A row already in memory is kept if it is at least
    /// as recent as the persisted one.
    ///
    /// The store is marked loaded even if `persisted` is `None` or malformed: the hydration
    /// attempt is complete.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPayload`] if `persisted` cannot be parsed. Nothing is merged in that case.
    pub fn load_persisted(&mut self, persisted: Option<&str>) -> Result<()> {
        self.loaded = true;
        let Some(persisted) = persisted else {
            return Ok(());
        };

        let rows: HashMap<String, CacheRow> = serde_json::from_str(persisted)?;
        for (key, row) in rows {
            match self.rows.get(&key) {
                Some(existing) if existing.time >= row.time && !existing.is_empty() => {}
                _ => {
                    self.rows.insert(key, row);
                }
            }
        }

        if self.reason == EvaluationReason::Uninitialized {
            let key = self.current_key.clone();
            if self.find_row(&key).is_some_and(|row| !row.is_empty()) {
                self.row_mut(&key);
                self.reason = EvaluationReason::Cache;
            }
        }

        self.evict();
        log::debug!(target: "statsig", rows = self.rows.len(), reason:display = self.reason; "loaded persisted values");
        Ok(())
    }

    /// Serialized rows for persistent storage. Overrides are not included.
    pub fn persisted_snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.rows)?)
    }

    /// Switch the active identity to `key`, creating an empty row if none is cached.
    ///
    /// Returns `true` if a non-empty row was already cached for the identity.
    pub fn update_user(&mut self, key: UserCacheKey, is_prefetched: bool) -> bool {
        self.current_key = key.clone();
        let found = !self.row_mut(&key).is_empty();

        self.reason = match (found, is_prefetched) {
            (true, true) => EvaluationReason::Network,
            (true, false) => EvaluationReason::Cache,
            (false, _) => EvaluationReason::Uninitialized,
        };
        self.evict();

        log::debug!(target: "statsig", key:display = key.v1, found = found, is_prefetched = is_prefetched; "switched user");
        found
    }

    /// Move the active row to `key` without changing the reason. Used when the stable ID of the
    /// active identity changed.
    pub fn rekey_current(&mut self, key: UserCacheKey) {
        if key == self.current_key {
            return;
        }
        if let Some(row) = self.rows.remove(&self.current_key.v1) {
            self.rows.entry(key.v1.clone()).or_insert(row);
        }
        self.current_key = key;
    }

    /// Server time of the last update for `key`, if the row was fetched for the same user object.
    /// Sent as `sinceTime` so the server can reply with no content.
    pub fn last_update_time(&self, key: &UserCacheKey, user_hash: &str) -> Option<i64> {
        self.find_row(key)
            .filter(|row| row.user_hash == user_hash && row.time > 0)
            .map(|row| row.time)
    }

    /// Cached row of `key`, if any.
    pub fn row(&self, key: &UserCacheKey) -> Option<&CacheRow> {
        self.find_row(key)
    }

    /// Serve `value` for gate `name`. Ignored while overrides are disabled.
    pub fn set_gate_override(&mut self, name: &str, value: bool) {
        if self.check_overrides_enabled() {
            self.overrides.gates.insert(name.to_owned(), value);
        }
    }

    /// Serve `value` for config or experiment `name`. Ignored while overrides are disabled.
    pub fn set_config_override(&mut self, name: &str, value: Map<String, Value>) {
        if self.check_overrides_enabled() {
            self.overrides.configs.insert(name.to_owned(), value);
        }
    }

    /// Serve `value` for layer `name`. Ignored while overrides are disabled.
    pub fn set_layer_override(&mut self, name: &str, value: Map<String, Value>) {
        if self.check_overrides_enabled() {
            self.overrides.layers.insert(name.to_owned(), value);
        }
    }

    /// Remove the gate override of `name`, or all gate overrides if `name` is `None`.
    pub fn remove_gate_override(&mut self, name: Option<&str>) {
        remove_override(&mut self.overrides.gates, name);
    }

    /// Remove the config override of `name`, or all config overrides if `name` is `None`.
    pub fn remove_config_override(&mut self, name: Option<&str>) {
        remove_override(&mut self.overrides.configs, name);
    }

    /// Remove the layer override of `name`, or all layer overrides if `name` is `None`.
    pub fn remove_layer_override(&mut self, name: Option<&str>) {
        remove_override(&mut self.overrides.layers, name);
    }

    /// Snapshot of all overrides.
    pub fn all_overrides(&self) -> StatsigOverrides {
        self.overrides.clone()
    }

    fn check_overrides_enabled(&self) -> bool {
        if self.overrides_disabled {
            log::warn!(target: "statsig", "overrides are disabled, ignoring override");
        }
        !self.overrides_disabled
    }

    fn override_record(&self, kind: EvaluationKind, name: &str) -> Option<EvaluationRecord> {
        let value = match kind {
            EvaluationKind::Gate => Value::Bool(*self.overrides.gates.get(name)?),
            EvaluationKind::Config | EvaluationKind::Experiment => {
                Value::Object(self.overrides.configs.get(name)?.clone())
            }
            EvaluationKind::Layer => Value::Object(self.overrides.layers.get(name)?.clone()),
        };
        Some(EvaluationRecord::with_value(kind, name, OVERRIDE_RULE_ID, value))
    }

    fn current_row(&self) -> Option<&CacheRow> {
        self.find_row(&self.current_key)
    }

    fn current_time(&self) -> i64 {
        match self.current_row() {
            Some(row) if row.time > 0 => row.time,
            _ => self.clock.now_millis(),
        }
    }

    /// Rows are stored under `v1`. Rows written before the stable ID was part of the key are found
    /// under `v2`.
    fn find_row(&self, key: &UserCacheKey) -> Option<&CacheRow> {
        self.rows.get(&key.v1).or_else(|| self.rows.get(&key.v2))
    }

    /// Row of `key`, migrating a `v2` row to `v1` or creating an empty row as needed.
    fn row_mut(&mut self, key: &UserCacheKey) -> &mut CacheRow {
        if !self.rows.contains_key(&key.v1) {
            let row = self.rows.remove(&key.v2).unwrap_or_default();
            self.rows.insert(key.v1.clone(), row);
        }
        self.rows.entry(key.v1.clone()).or_default()
    }

    fn evict(&mut self) {
        while self.rows.len() > MAX_CACHED_ROWS {
            let oldest = self
                .rows
                .iter()
                .filter(|(key, _)| **key != self.current_key.v1)
                .min_by_key(|(_, row)| row.time)
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else {
                break;
            };
            log::debug!(target: "statsig", key:display = oldest; "evicting cached row");
            self.rows.remove(&oldest);
        }
    }
}

fn is_sticky_kind(kind: EvaluationKind) -> bool {
    matches!(kind, EvaluationKind::Experiment | EvaluationKind::Layer)
}

fn remove_override<V>(overrides: &mut HashMap<String, V>, name: Option<&str>) {
    match name {
        Some(name) => {
            overrides.remove(name);
        }
        None => overrides.clear(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;
    use crate::hashing::{djb2_hash, get_user_cache_key};

    pub(crate) fn key(user_id: &str) -> UserCacheKey {
        get_user_cache_key("stable", Some(&crate::StatsigUser::with_user_id(user_id)))
    }

    fn store() -> EvaluationStore {
        EvaluationStore::new(key("a"), Arc::new(|| 1_000i64))
    }

    fn loaded_store() -> EvaluationStore {
        let mut store = store();
        store.save(&key("a"), "hash-a", payload("a_config_value", 10)).unwrap();
        store
    }

    pub(crate) fn payload(experiment_value: &str, time: i64) -> Value {
        json!({
            "feature_gates": {
                sha256_hash("a_gate"): {
                    "name": sha256_hash("a_gate"),
                    "value": true,
                    "rule_id": "gate_rule",
                    "secondary_exposures": [{"gate": "dep", "gateValue": "true", "ruleID": "r1"}]
                }
            },
            "dynamic_configs": {
                sha256_hash("an_experiment"): {
                    "name": sha256_hash("an_experiment"),
                    "value": {"key": experiment_value},
                    "rule_id": format!("rule_{experiment_value}"),
                    "is_user_in_experiment": true,
                    "is_experiment_active": true
                },
                sha256_hash("inactive_experiment"): {
                    "name": sha256_hash("inactive_experiment"),
                    "value": {"key": experiment_value},
                    "rule_id": "inactive",
                    "is_user_in_experiment": true,
                    "is_experiment_active": false
                }
            },
            "layer_configs": {},
            "has_updates": true,
            "time": time
        })
    }

    const STICKY: ResolveOptions = ResolveOptions {
        ignore_overrides: false,
        keep_device_value: true,
    };

    #[test]
    fn not_loaded_before_hydration_even_with_overrides() {
        let mut store = store();
        store.set_gate_override("a_gate", true);

        let result = store.resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default());

        assert!(matches!(result, Err(Error::NotLoaded)));
    }

    #[test]
    fn resolves_fetched_records_by_hashed_name() {
        let store = loaded_store();

        let resolution = store
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap();

        assert!(resolution.record.gate_value());
        assert_eq!(resolution.record.rule_id, "gate_rule");
        assert_eq!(resolution.details, EvaluationDetails::new(EvaluationReason::Network, 10));
    }

    #[test]
    fn resolves_names_hashed_as_reported_by_the_payload() {
        let mut store = store();
        store
            .save(
                &key("a"),
                "hash-a",
                json!({
                    "feature_gates": {
                        djb2_hash("a_gate"): {"name": djb2_hash("a_gate"), "value": true, "rule_id": "djb2_rule"}
                    },
                    "has_updates": true,
                    "hash_used": "djb2",
                    "time": 10
                }),
            )
            .unwrap();

        let resolution = store
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap();
        assert_eq!(resolution.record.rule_id, "djb2_rule");
        assert_eq!(resolution.details.reason, EvaluationReason::Network);

        let restored = {
            let mut restored = EvaluationStore::new(key("a"), Arc::new(|| 1_000i64));
            restored
                .load_persisted(Some(&store.persisted_snapshot().unwrap()))
                .unwrap();
            restored
        };
        assert!(restored
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap()
            .record
            .gate_value());
    }

    #[test]
    fn resolves_plain_names() {
        let mut store = store();
        store
            .save(
                &key("a"),
                "",
                json!({"feature_gates": {"plain": {"name": "plain", "value": true}}, "has_updates": true}),
            )
            .unwrap();

        let resolution = store
            .resolve(EvaluationKind::Gate, "plain", ResolveOptions::default())
            .unwrap();

        assert!(resolution.record.gate_value());
    }

    #[test]
    fn unknown_names_are_unrecognized() {
        let store = loaded_store();

        let resolution = store
            .resolve(EvaluationKind::Config, "nope", ResolveOptions::default())
            .unwrap();

        assert_eq!(resolution.details.reason, EvaluationReason::Unrecognized);
        assert_eq!(resolution.record.rule_id, "");
        assert_eq!(resolution.record.value, json!({}));
    }

    #[test]
    fn overrides_take_precedence_unless_ignored() {
        let mut store = loaded_store();
        store.set_gate_override("a_gate", false);

        let overridden = store
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap();
        let ignored = store
            .resolve(
                EvaluationKind::Gate,
                "a_gate",
                ResolveOptions {
                    ignore_overrides: true,
                    keep_device_value: false,
                },
            )
            .unwrap();

        assert!(!overridden.record.gate_value());
        assert_eq!(overridden.details.reason, EvaluationReason::LocalOverride);
        assert_eq!(overridden.record.rule_id, "override");
        assert!(ignored.record.gate_value());
    }

    #[test]
    fn overrides_are_grouped_and_removable() {
        let mut store = loaded_store();
        store.set_gate_override("g1", true);
        store.set_gate_override("g2", false);
        store.set_config_override("c", json!({"k": 1}).as_object().unwrap().clone());
        store.set_layer_override("l", Map::new());

        store.remove_gate_override(Some("g1"));
        let overrides = store.all_overrides();
        assert_eq!(overrides.gates, HashMap::from([("g2".to_owned(), false)]));
        assert_eq!(overrides.configs.len(), 1);
        assert_eq!(overrides.layers.len(), 1);

        store.remove_gate_override(None);
        store.remove_config_override(None);
        store.remove_layer_override(Some("l"));
        assert_eq!(store.all_overrides(), StatsigOverrides::default());
    }

    #[test]
    fn disabled_overrides_are_ignored() {
        let mut store = loaded_store();
        store.disable_overrides();
        store.set_gate_override("a_gate", false);

        let resolution = store
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap();

        assert!(resolution.record.gate_value());
        assert!(store.all_overrides().gates.is_empty());
    }

    #[test]
    fn overrides_are_not_persisted() {
        let mut store = loaded_store();
        store.set_gate_override("a_gate", false);

        let snapshot = store.persisted_snapshot().unwrap();

        assert!(!snapshot.contains("override"));
    }

    #[test]
    fn resolve_reports_capture_without_mutating() {
        let store = loaded_store();

        let resolution = store
            .resolve(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();

        assert!(resolution.capture_sticky);
        assert!(store.row(&key("a")).unwrap().sticky_values.is_empty());
    }

    #[test]
    fn sticky_value_survives_new_save() {
        let mut store = loaded_store();
        let (first, captured) = store
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();
        assert!(captured);
        assert_eq!(first.details.reason, EvaluationReason::Network);

        store.save(&key("a"), "hash-a", payload("new_value", 20)).unwrap();

        let (sticky, captured_again) = store
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();
        let latest = store
            .resolve(EvaluationKind::Experiment, "an_experiment", ResolveOptions::default())
            .unwrap();

        assert!(!captured_again);
        assert_eq!(sticky.details.reason, EvaluationReason::Sticky);
        assert_eq!(sticky.record.value, json!({"key": "a_config_value"}));
        assert_eq!(latest.record.value, json!({"key": "new_value"}));

        // Non-sticky reads do not release the pinned value.
        let (still_sticky, _) = store
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();
        assert_eq!(still_sticky.record.value, json!({"key": "a_config_value"}));
    }

    #[test]
    fn inactive_experiments_are_not_captured() {
        let mut store = loaded_store();

        let (_, captured) = store
            .resolve_mut(EvaluationKind::Experiment, "inactive_experiment", STICKY)
            .unwrap();

        assert!(!captured);
    }

    #[test]
    fn configs_are_never_sticky() {
        let mut store = loaded_store();

        let (_, captured) = store
            .resolve_mut(EvaluationKind::Config, "an_experiment", STICKY)
            .unwrap();

        assert!(!captured);
    }

    #[test]
    fn removed_sticky_value_is_recaptured() {
        let mut store = loaded_store();
        store
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();
        store.save(&key("a"), "hash-a", payload("new_value", 20)).unwrap();

        assert!(store.remove_sticky_value("an_experiment"));
        let (resolution, captured) = store
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();

        assert!(captured);
        assert_eq!(resolution.record.value, json!({"key": "new_value"}));
    }

    #[test]
    fn sticky_values_belong_to_identity() {
        let mut store = loaded_store();
        store
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();

        store.update_user(key("b"), false);
        store.save(&key("b"), "hash-b", payload("b_value", 30)).unwrap();
        let resolution = store
            .resolve(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();

        assert_eq!(resolution.record.value, json!({"key": "b_value"}));
        assert_eq!(resolution.details.reason, EvaluationReason::Network);
    }

    #[test]
    fn no_content_leaves_records_untouched() {
        let mut store = loaded_store();
        let before = store.persisted_snapshot().unwrap();

        let outcome = store
            .save(&key("a"), "hash-a", json!({"is_no_content": true, "time": 99}))
            .unwrap();

        assert_eq!(outcome, SaveOutcome::NotModified);
        assert_eq!(store.persisted_snapshot().unwrap(), before);
        assert_eq!(
            store.evaluation_details().reason,
            EvaluationReason::NetworkNotModified
        );
    }

    #[test]
    fn malformed_payload_keeps_prior_state() {
        let mut store = loaded_store();
        let before = store.persisted_snapshot().unwrap();

        let result = store.save(&key("a"), "hash-a", json!({"feature_gates": "nope", "has_updates": true}));

        assert!(matches!(result, Err(Error::MalformedPayload(_))));
        assert_eq!(store.persisted_snapshot().unwrap(), before);
        assert_eq!(store.evaluation_details().reason, EvaluationReason::Network);
    }

    #[test]
    fn row_time_never_decreases() {
        let mut store = loaded_store();

        store.save(&key("a"), "hash-a", payload("older", 5)).unwrap();

        assert_eq!(store.row(&key("a")).unwrap().time, 10);
    }

    #[test]
    fn update_user_reports_cached_rows() {
        let mut store = loaded_store();

        assert!(!store.update_user(key("b"), false));
        assert_eq!(store.evaluation_details().reason, EvaluationReason::Uninitialized);
        assert!(store.row(&key("b")).is_some());

        assert!(store.update_user(key("a"), false));
        assert_eq!(store.evaluation_details().reason, EvaluationReason::Cache);

        assert!(store.update_user(key("a"), true));
        assert_eq!(store.evaluation_details().reason, EvaluationReason::Network);
    }

    #[test]
    fn saving_for_another_user_keeps_active_reason() {
        let mut store = loaded_store();
        store.update_user(key("a"), false);

        store.save(&key("b"), "hash-b", payload("b", 50)).unwrap();

        assert_eq!(store.evaluation_details().reason, EvaluationReason::Cache);
        assert!(!store.row(&key("b")).unwrap().is_empty());
    }

    #[test]
    fn evicts_least_recently_updated_rows() {
        let mut store = loaded_store();
        for i in 0..MAX_CACHED_ROWS {
            let user = format!("user-{i}");
            store
                .save(&key(&user), "", payload("v", 100 + i as i64))
                .unwrap();
        }

        assert_eq!(store.rows.len(), MAX_CACHED_ROWS);
        // The active row is never evicted, even though it is the oldest.
        assert!(store.row(&key("a")).is_some());
        assert!(store.row(&key("user-0")).is_none());
        assert!(store.row(&key("user-1")).is_some());
    }

    #[test]
    fn loads_persisted_rows() {
        let mut source = loaded_store();
        source
            .resolve_mut(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();
        let snapshot = source.persisted_snapshot().unwrap();

        let mut store = store();
        store.load_persisted(Some(&snapshot)).unwrap();

        let resolution = store
            .resolve(EvaluationKind::Experiment, "an_experiment", STICKY)
            .unwrap();
        assert_eq!(resolution.details.reason, EvaluationReason::Sticky);
        assert_eq!(store.evaluation_details(), EvaluationDetails::new(EvaluationReason::Cache, 10));
    }

    #[test]
    fn persisted_rows_do_not_replace_newer_memory() {
        let mut older = store();
        older.save(&key("a"), "hash-a", payload("old", 5)).unwrap();
        let snapshot = older.persisted_snapshot().unwrap();

        let mut store = loaded_store();
        store.load_persisted(Some(&snapshot)).unwrap();

        let resolution = store
            .resolve(EvaluationKind::Experiment, "an_experiment", ResolveOptions::default())
            .unwrap();
        assert_eq!(resolution.record.value, json!({"key": "a_config_value"}));
        assert_eq!(store.evaluation_details().reason, EvaluationReason::Network);
    }

    #[test]
    fn empty_storage_still_loads() {
        let mut store = store();

        store.load_persisted(None).unwrap();

        let resolution = store
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap();
        assert_eq!(resolution.details, EvaluationDetails::new(EvaluationReason::Uninitialized, 1_000));
    }

    #[test]
    fn malformed_persisted_rows_are_rejected() {
        let mut store = store();

        let result = store.load_persisted(Some("not json"));

        assert!(matches!(result, Err(Error::MalformedPayload(_))));
        assert!(store.is_loaded());
    }

    #[test]
    fn lenient_persisted_sections() {
        let mut store = store();
        let persisted = json!({
            key("a").v1: {
                "feature_gates": {
                    sha256_hash("a_gate"): {"value": true, "rule_id": "ruleID12"}
                },
                "dynamic_configs": [],
                "time": 1646026677415i64
            }
        });

        store.load_persisted(Some(&persisted.to_string())).unwrap();

        let resolution = store
            .resolve(EvaluationKind::Gate, "a_gate", ResolveOptions::default())
            .unwrap();
        assert!(resolution.record.gate_value());
        assert_eq!(resolution.details.time, 1646026677415);
    }

    #[test]
    fn rows_keyed_by_v2_are_migrated() {
        let v2_row = json!({
            key("a").v2: {
                "feature_gates": {sha256_hash("a_gate"): {"value": true}},
                "time": 3
            }
        });
        let mut store = store();
        store.load_persisted(Some(&v2_row.to_string())).unwrap();

        assert_eq!(store.evaluation_details().reason, EvaluationReason::Cache);
        assert!(store.rows.contains_key(&key("a").v1));
        assert!(!store.rows.contains_key(&key("a").v2));
    }

    #[test]
    fn since_time_requires_matching_user_hash() {
        let store = loaded_store();

        assert_eq!(store.last_update_time(&key("a"), "hash-a"), Some(10));
        assert_eq!(store.last_update_time(&key("a"), "other"), None);
        assert_eq!(store.last_update_time(&key("b"), "hash-a"), None);
    }

    #[test]
    fn rekey_keeps_active_row() {
        let mut store = store();
        store.bootstrap("hash-a", payload("boot", 7)).unwrap();
        let new_key = get_user_cache_key("persisted", Some(&crate::StatsigUser::with_user_id("a")));

        store.rekey_current(new_key.clone());

        assert!(store.row(&new_key).is_some());
        assert_eq!(store.current_key(), &new_key);
        assert_eq!(store.evaluation_details().reason, EvaluationReason::Bootstrap);
    }

    #[test]
    fn bootstrap_marks_reason() {
        let mut store = store();

        store.bootstrap("hash-a", payload("boot", 7)).unwrap();

        let resolution = store
            .resolve(EvaluationKind::Experiment, "an_experiment", ResolveOptions::default())
            .unwrap();
        assert_eq!(resolution.details, EvaluationDetails::new(EvaluationReason::Bootstrap, 7));
    }
}
