//! Exposure and custom events: shaping, deduplication, and buffering.
//!
//! An exposure records that application code consumed an evaluation. Exposures with the same
//! kind, name, rule ID, and identity are logged once per buffering window; the window ends with
//! each flush.
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    evaluation::{EvaluationDetails, EvaluationKind, EvaluationRecord, SecondaryExposure},
    hashing::UserCacheKey,
    identity::StatsigMetadata,
    layer::Layer,
    user::{MAX_OBJ_SIZE, MAX_VALUE_SIZE},
    Clock, Error, Result, StatsigUser,
};

pub(crate) const GATE_EXPOSURE_EVENT: &str = "statsig::gate_exposure";
pub(crate) const CONFIG_EXPOSURE_EVENT: &str = "statsig::config_exposure";
pub(crate) const LAYER_EXPOSURE_EVENT: &str = "statsig::layer_exposure";

/// Default number of buffered events that triggers a flush.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 100;
pub(crate) const MIN_BUFFER_SIZE: usize = 2;
pub(crate) const MAX_BUFFER_SIZE: usize = 500;

/// Value of a custom event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum EventValue {
    /// Text value, truncated to the maximum value length.
    String(String),
    /// Numeric value.
    Number(f64),
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// A single analytics event, as sent to the event logging endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Name of the event. Exposure events use the `statsig::` prefix.
    pub event_name: String,
    /// User the event was logged for, without private attributes.
    pub user: Value,
    /// Optional value of a custom event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<EventValue>,
    /// String metadata. Exposures carry the evaluated name, rule, and reason here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Epoch millis at which the event was logged.
    pub time: i64,
    /// Gates evaluated on the way to the exposed value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_exposures: Vec<SecondaryExposure>,
}

/// A batch of events flushed from the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    /// Events in the order they were logged.
    pub events: Vec<LogEvent>,
    /// Device metadata at the time of the flush.
    pub statsig_metadata: StatsigMetadata,
}

/// Receives flushed event batches.
///
/// Implement this trait to forward events to your own pipeline. Any `Fn(EventBatch)` closure
/// implements it.
///
/// ```
/// # use statsig::{ClientConfig, EventBatch};
/// let config = ClientConfig::from_sdk_key("client-key").with_event_logger(|batch: EventBatch| {
///     println!("{} events", batch.events.len());
/// });
/// ```
pub trait EventLogger {
    /// Deliver `batch`. Called from the thread or task that triggered the flush.
    fn log_events(&self, batch: EventBatch);
}

pub(crate) struct NoopEventLogger;
impl EventLogger for NoopEventLogger {
    fn log_events(&self, _batch: EventBatch) {}
}

impl<T: Fn(EventBatch)> EventLogger for T {
    fn log_events(&self, batch: EventBatch) {
        self(batch)
    }
}

/// User and identity an event is attributed to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExposureContext<'a> {
    pub user: &'a StatsigUser,
    pub cache_key: &'a UserCacheKey,
}

struct LoggerState {
    buffer: Vec<LogEvent>,
    seen: HashSet<String>,
    metadata: StatsigMetadata,
}

pub(crate) struct ExposureLogger {
    state: Mutex<LoggerState>,
    max_buffer_size: usize,
    sink: Arc<dyn EventLogger + Send + Sync>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl ExposureLogger {
    pub fn new(
        max_buffer_size: usize,
        metadata: StatsigMetadata,
        sink: Arc<dyn EventLogger + Send + Sync>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> ExposureLogger {
        ExposureLogger {
            state: Mutex::new(LoggerState {
                buffer: Vec::new(),
                seen: HashSet::new(),
                metadata,
            }),
            max_buffer_size: max_buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
            sink,
            clock,
        }
    }

    /// Replace the metadata attached to subsequent batches (e.g., after the stable ID was loaded).
    pub fn set_metadata(&self, metadata: StatsigMetadata) -> Result<()> {
        self.lock()?.metadata = metadata;
        Ok(())
    }

    /// Returns `true` if the exposure was enqueued, `false` if it was a duplicate.
    pub fn log_gate_exposure(
        &self,
        context: ExposureContext<'_>,
        name: &str,
        record: &EvaluationRecord,
        details: EvaluationDetails,
        is_manual: bool,
    ) -> Result<bool> {
        let gate_value = record.gate_value().to_string();
        let dedup_key = dedup_key(EvaluationKind::Gate, name, &record.rule_id, context.cache_key);

        let mut metadata = BTreeMap::from([
            ("gate".to_owned(), name.to_owned()),
            ("gateValue".to_owned(), gate_value),
            ("ruleID".to_owned(), record.rule_id.clone()),
        ]);
        add_details(&mut metadata, details, is_manual);

        let event = self.event(
            GATE_EXPOSURE_EVENT,
            context.user,
            None,
            metadata,
            record.secondary_exposures.clone(),
        )?;
        self.enqueue(Some(dedup_key), event)
    }

    /// Exposure of a dynamic config or experiment.
    pub fn log_config_exposure(
        &self,
        context: ExposureContext<'_>,
        kind: EvaluationKind,
        name: &str,
        record: &EvaluationRecord,
        details: EvaluationDetails,
        is_manual: bool,
    ) -> Result<bool> {
        let dedup_key = dedup_key(kind, name, &record.rule_id, context.cache_key);

        let mut metadata = BTreeMap::from([
            ("config".to_owned(), name.to_owned()),
            ("ruleID".to_owned(), record.rule_id.clone()),
        ]);
        add_details(&mut metadata, details, is_manual);

        let event = self.event(
            CONFIG_EXPOSURE_EVENT,
            context.user,
            None,
            metadata,
            record.secondary_exposures.clone(),
        )?;
        self.enqueue(Some(dedup_key), event)
    }

    /// Exposure of a single layer parameter. Attribution follows [`Layer::provenance`].
    pub fn log_layer_exposure(
        &self,
        context: ExposureContext<'_>,
        layer: &Layer,
        parameter: &str,
        is_manual: bool,
    ) -> Result<bool> {
        let provenance = layer.provenance(parameter);
        let dedup_key = dedup_key(
            EvaluationKind::Layer,
            &format!("{}|{parameter}", layer.name()),
            layer.rule_id(),
            context.cache_key,
        );

        let mut metadata = BTreeMap::from([
            ("config".to_owned(), layer.name().to_owned()),
            ("ruleID".to_owned(), layer.rule_id().to_owned()),
            (
                "allocatedExperiment".to_owned(),
                provenance.allocated_experiment.unwrap_or("").to_owned(),
            ),
            ("parameterName".to_owned(), parameter.to_owned()),
            (
                "isExplicitParameter".to_owned(),
                provenance.is_explicit.to_string(),
            ),
        ]);
        add_details(&mut metadata, layer.evaluation_details(), is_manual);

        let event = self.event(
            LAYER_EXPOSURE_EVENT,
            context.user,
            None,
            metadata,
            provenance.secondary_exposures.to_vec(),
        )?;
        self.enqueue(Some(dedup_key), event)
    }

    /// Custom event. Custom events are never deduplicated.
    ///
    /// Name and string value are truncated to 64 characters. Metadata larger than 2048 bytes is
    /// replaced by an error marker.
    pub fn log_custom_event(
        &self,
        user: &StatsigUser,
        name: &str,
        value: Option<EventValue>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("event name must not be empty".to_owned()));
        }

        let name = truncate(name);
        let value = value.map(|value| match value {
            EventValue::String(s) => EventValue::String(truncate(&s)),
            value => value,
        });
        let mut metadata = metadata.unwrap_or_default();
        if serde_json::to_string(&metadata)?.len() > MAX_OBJ_SIZE {
            log::warn!(target: "statsig", event = name.as_str(); "event metadata is too large, dropping it");
            metadata = BTreeMap::from([(
                "error".to_owned(),
                "not logged due to size too large".to_owned(),
            )]);
        }

        let event = self.event(&name, user, value, metadata, Vec::new())?;
        self.enqueue(None, event)?;
        Ok(())
    }

    /// Hand all buffered events to the sink and start a new dedup window.
    pub fn flush(&self) -> Result<()> {
        let batch = take_batch(&mut *self.lock()?);
        self.send(batch);
        Ok(())
    }

    /// Start a new dedup window without flushing, e.g., after the user changed.
    pub fn reset_dedupe_keys(&self) -> Result<()> {
        self.lock()?.seen.clear();
        Ok(())
    }

    fn event(
        &self,
        event_name: &str,
        user: &StatsigUser,
        value: Option<EventValue>,
        metadata: BTreeMap<String, String>,
        secondary_exposures: Vec<SecondaryExposure>,
    ) -> Result<LogEvent> {
        let mut user = user.clone();
        user.private_attributes.clear();
        Ok(LogEvent {
            event_name: event_name.to_owned(),
            user: serde_json::to_value(&user)?,
            value,
            metadata,
            time: self.clock.now_millis(),
            secondary_exposures,
        })
    }

    fn enqueue(&self, dedup_key: Option<String>, event: LogEvent) -> Result<bool> {
        let batch = {
            let mut state = self.lock()?;
            if let Some(dedup_key) = dedup_key {
                if !state.seen.insert(dedup_key) {
                    return Ok(false);
                }
            }
            log::trace!(target: "statsig", event = event.event_name.as_str(); "enqueued event");
            state.buffer.push(event);
            if state.buffer.len() < self.max_buffer_size {
                return Ok(true);
            }
            take_batch(&mut state)
        };
        self.send(batch);
        Ok(true)
    }

    fn send(&self, batch: Option<EventBatch>) {
        if let Some(batch) = batch {
            log::debug!(target: "statsig", count = batch.events.len(); "flushing events");
            self.sink.log_events(batch);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoggerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Panicked("exposure logger lock poisoned".to_owned()))
    }
}

/// Drain the buffer and start a new dedup window.
fn take_batch(state: &mut LoggerState) -> Option<EventBatch> {
    state.seen.clear();
    if state.buffer.is_empty() {
        return None;
    }
    Some(EventBatch {
        events: std::mem::take(&mut state.buffer),
        statsig_metadata: state.metadata.clone(),
    })
}

fn dedup_key(kind: EvaluationKind, name: &str, rule_id: &str, cache_key: &UserCacheKey) -> String {
    format!("{kind}|{name}|{rule_id}|{}", cache_key.v1)
}

fn add_details(metadata: &mut BTreeMap<String, String>, details: EvaluationDetails, is_manual: bool) {
    metadata.insert("reason".to_owned(), details.reason.to_string());
    metadata.insert("time".to_owned(), details.time.to_string());
    if is_manual {
        metadata.insert("isManualExposure".to_owned(), "true".to_owned());
    }
}

fn truncate(value: &str) -> String {
    if value.chars().count() > MAX_VALUE_SIZE {
        value.chars().take(MAX_VALUE_SIZE).collect()
    } else {
        value.to_owned()
    }
}
