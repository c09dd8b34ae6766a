//! The single place where failures of public operations are turned into fallback values.
//!
//! Internal components return [`Result`]. Public entry points run their work through
//! [`ErrorBoundary`], which reports the error to [`Telemetry`] and hands the caller a safe
//! default. Panics in synchronous work are caught as well.
use std::{
    any::Any,
    collections::HashSet,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use serde::Serialize;

use crate::{Error, Result};

/// A failure reported by the SDK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Public operation that failed, e.g. `checkGate`.
    pub tag: String,
    /// Kind of the error, see [`Error::kind`].
    pub kind: &'static str,
    /// Display form of the error.
    pub message: String,
    /// Client SDK key of the reporting client.
    pub sdk_key: String,
}

/// Sink of error reports. Reporting must not affect control flow.
///
/// Any `Fn(&ErrorReport)` closure implements it.
pub trait Telemetry {
    /// Record a single failure.
    fn report(&self, report: &ErrorReport);
}

pub(crate) struct NoopTelemetry;
impl Telemetry for NoopTelemetry {
    fn report(&self, _report: &ErrorReport) {}
}

impl<T: Fn(&ErrorReport)> Telemetry for T {
    fn report(&self, report: &ErrorReport) {
        self(report)
    }
}

pub(crate) struct ErrorBoundary {
    sdk_key: String,
    telemetry: Arc<dyn Telemetry + Send + Sync>,
    /// (tag, kind) pairs already reported.
    reported: Mutex<HashSet<(String, &'static str)>>,
}

impl ErrorBoundary {
    pub fn new(sdk_key: &str, telemetry: Arc<dyn Telemetry + Send + Sync>) -> ErrorBoundary {
        ErrorBoundary {
            sdk_key: sdk_key.to_owned(),
            telemetry,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Run `task`, returning `fallback()` if it fails or panics.
    pub fn capture<T>(
        &self,
        tag: &str,
        task: impl FnOnce() -> Result<T>,
        fallback: impl FnOnce() -> T,
    ) -> T {
        match self.run(task) {
            Ok(value) => value,
            Err(err) => {
                self.report(tag, &err);
                fallback()
            }
        }
    }

    /// Run `task`, absorbing any failure.
    pub fn swallow(&self, tag: &str, task: impl FnOnce() -> Result<()>) {
        self.capture(tag, task, || ())
    }

    /// Await `task`, returning `fallback()` if it fails.
    ///
    /// Panics inside `task` are not caught here. Synchronous steps of `task` should go through
    /// [`capture`](Self::capture).
    pub async fn capture_async<T>(
        &self,
        tag: &str,
        task: impl Future<Output = Result<T>>,
        fallback: impl FnOnce() -> T,
    ) -> T {
        match task.await {
            Ok(value) => value,
            Err(err) => {
                self.report(tag, &err);
                fallback()
            }
        }
    }

    pub async fn swallow_async(&self, tag: &str, task: impl Future<Output = Result<()>>) {
        self.capture_async(tag, task, || ()).await
    }

    /// Log `err` and forward it to telemetry, once per (tag, kind).
    pub fn report(&self, tag: &str, err: &Error) {
        log::warn!(target: "statsig", tag = tag, kind = err.kind(); "{tag} failed: {err}");

        let first = match self.reported.lock() {
            Ok(mut reported) => reported.insert((tag.to_owned(), err.kind())),
            Err(_) => false,
        };
        if !first {
            return;
        }

        let report = ErrorReport {
            tag: tag.to_owned(),
            kind: err.kind(),
            message: err.to_string(),
            sdk_key: self.sdk_key.clone(),
        };
        // A panicking sink must not escape the boundary.
        let telemetry = &self.telemetry;
        if catch_unwind(AssertUnwindSafe(|| telemetry.report(&report))).is_err() {
            log::warn!(target: "statsig", tag = tag; "telemetry sink panicked");
        }
    }

    fn run<T>(&self, task: impl FnOnce() -> Result<T>) -> Result<T> {
        catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| Err(panicked(payload)))
    }
}

/// Convert a panic payload into [`Error::Panicked`].
fn panicked(payload: Box<dyn Any + Send>) -> Error {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    };
    Error::Panicked(message)
}
