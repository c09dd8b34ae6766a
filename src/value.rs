//! Typed access to JSON parameter values of configs, experiments, and layers.
//!
//! Parameter values are stored as [`serde_json::Value`], a tagged union of null, boolean, number,
//! string, array, and object. Typed getters go through [`ParamValue`], which only accepts a value
//! whose JSON kind matches the requested type. Arrays never satisfy an object request and objects
//! never satisfy an array request. On mismatch, getters return the caller's default.
use std::collections::HashMap;

use serde_json::{Map, Value};

/// A Rust type that can be read out of a JSON parameter value.
///
/// Implementations return `None` when the JSON kind does not match the type.
pub trait ParamValue: Sized {
    /// Convert `value` into `Self` if its kind matches.
    fn from_param(value: &Value) -> Option<Self>;
}

impl ParamValue for bool {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl ParamValue for String {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_str().map(ToOwned::to_owned)
    }
}

impl ParamValue for f64 {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

/// Integers only match integral JSON numbers within range.
impl ParamValue for i64 {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_i64().or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
                .map(|f| f as i64)
        })
    }
}

impl ParamValue for i32 {
    fn from_param(value: &Value) -> Option<Self> {
        i64::from_param(value).and_then(|i| i32::try_from(i).ok())
    }
}

impl ParamValue for u64 {
    fn from_param(value: &Value) -> Option<Self> {
        value
            .as_u64()
            .or_else(|| i64::from_param(value).and_then(|i| u64::try_from(i).ok()))
    }
}

/// Every element must convert, otherwise the whole array is rejected.
impl<T: ParamValue> ParamValue for Vec<T> {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_array()?.iter().map(T::from_param).collect()
    }
}

impl ParamValue for Map<String, Value> {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_object().cloned()
    }
}

impl<T: ParamValue> ParamValue for HashMap<String, T> {
    fn from_param(value: &Value) -> Option<Self> {
        value
            .as_object()?
            .iter()
            .map(|(k, v)| T::from_param(v).map(|v| (k.clone(), v)))
            .collect()
    }
}

/// Accepts any non-null value.
impl ParamValue for Value {
    fn from_param(value: &Value) -> Option<Self> {
        (!value.is_null()).then(|| value.clone())
    }
}

/// Look up `key` in `params` and convert it.
///
/// Returns `None` if the key is absent, null, rejected by `guard`, or of a different kind than
/// `T`.
pub(crate) fn lookup<T: ParamValue>(
    params: Option<&Map<String, Value>>,
    key: &str,
    guard: Option<&dyn Fn(&Value) -> bool>,
) -> Option<T> {
    let value = params?.get(key).filter(|v| !v.is_null())?;
    if let Some(guard) = guard {
        if !guard(value) {
            return None;
        }
    }
    T::from_param(value)
}
