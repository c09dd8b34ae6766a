//! Read-only view of a resolved layer.
use std::sync::Arc;

use serde_json::Value;

use crate::{
    evaluation::{EvaluationDetails, EvaluationRecord, SecondaryExposure},
    value::{lookup, ParamValue},
};

/// Called once for every parameter read that returns a value from the layer.
pub type LayerExposureCallback = Arc<dyn Fn(&Layer, &str) + Send + Sync>;

/// Which exposures a parameter read is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance<'a> {
    /// Exposures logged along with the parameter.
    pub secondary_exposures: &'a [SecondaryExposure],
    /// Allocated experiment, for parameters it owns.
    pub allocated_experiment: Option<&'a str>,
    /// `true` if the allocated experiment owns the parameter.
    pub is_explicit: bool,
}

/// A layer evaluated for the current user.
///
/// Every successful parameter read triggers an exposure. Reads of absent keys, or keys whose
/// value does not match the requested type, return the default and log nothing.
///
/// ```no_run
/// # async fn example(client: &statsig::Client) {
/// let layer = client.get_layer("homepage", false);
/// let title: String = layer.get("title", "Welcome".to_owned());
/// # }
/// ```
#[derive(Clone)]
pub struct Layer {
    name: String,
    record: Arc<EvaluationRecord>,
    details: EvaluationDetails,
    on_exposure: Option<LayerExposureCallback>,
}

impl Layer {
    pub(crate) fn new(
        name: &str,
        record: Arc<EvaluationRecord>,
        details: EvaluationDetails,
        on_exposure: Option<LayerExposureCallback>,
    ) -> Layer {
        Layer {
            name: name.to_owned(),
            record,
            details,
            on_exposure,
        }
    }

    /// Unhashed layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rule that produced the parameters. Empty for unknown layers.
    pub fn rule_id(&self) -> &str {
        &self.record.rule_id
    }

    /// Experiment the user is allocated to within this layer, if any.
    pub fn allocated_experiment_name(&self) -> Option<&str> {
        self.record.allocated_experiment_name.as_deref()
    }

    /// Where the parameters came from.
    pub fn evaluation_details(&self) -> EvaluationDetails {
        self.details
    }

    /// Read `key`, returning `default` if it is absent or of a different type.
    pub fn get<T: ParamValue>(&self, key: &str, default: T) -> T {
        self.read(key, None).unwrap_or(default)
    }

    /// Like [`get`](Self::get), but the raw value must also satisfy `guard`.
    ///
    /// ```no_run
    /// # fn example(layer: &statsig::Layer) {
    /// let ratio: f64 = layer.get_with("ratio", 0.5, |v| v.as_f64().is_some_and(|r| r <= 1.0));
    /// # }
    /// ```
    pub fn get_with<T: ParamValue>(
        &self,
        key: &str,
        default: T,
        guard: impl Fn(&Value) -> bool,
    ) -> T {
        self.read(key, Some(&guard)).unwrap_or(default)
    }

    /// Raw value of `key`, if present and not null.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.read(key, None)
    }

    /// Exposure attribution of `parameter`.
    ///
    /// Explicit parameters are delegated to the allocated experiment and carry its secondary
    /// exposures. Any other parameter comes from the layer's own rule and is attributed to no
    /// experiment.
    pub fn provenance(&self, parameter: &str) -> Provenance<'_> {
        if self.record.explicit_parameters.contains(parameter) {
            Provenance {
                secondary_exposures: &self.record.secondary_exposures,
                allocated_experiment: self.record.allocated_experiment_name.as_deref(),
                is_explicit: true,
            }
        } else {
            Provenance {
                secondary_exposures: &self.record.undelegated_secondary_exposures,
                allocated_experiment: None,
                is_explicit: false,
            }
        }
    }

    fn read<T: ParamValue>(&self, key: &str, guard: Option<&dyn Fn(&Value) -> bool>) -> Option<T> {
        let value = lookup(self.record.parameters(), key, guard)?;
        if let Some(on_exposure) = &self.on_exposure {
            on_exposure(self, key);
        }
        Some(value)
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("record", &self.record)
            .field("details", &self.details)
            .field("logs_exposures", &self.on_exposure.is_some())
            .finish()
    }
}
