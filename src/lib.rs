//! A client-side SDK core for Statsig feature gates, dynamic configs, experiments, and layers.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that serves values fetched for a single current
//! [`StatsigUser`]. Values are fetched from the Statsig API during [`Client::initialize`] and on
//! [`Client::update_user`], cached per user identity, and optionally persisted through a
//! [`Storage`] implementation so that the next session can serve them before the network
//! responds.
//!
//! Reads ([`Client::check_gate`], [`Client::get_config`], [`Client::get_experiment`],
//! [`Client::get_layer`]) are synchronous and log exposure events. Exposures are deduplicated,
//! buffered, and handed to an [`EventLogger`] in batches.
//!
//! Experiments and layers read with `keep_device_value` are pinned to the device: the first value
//! read while the user is in an active experiment keeps being served even if the allocation
//! changes on the server.
//!
//! # Error Handling
//!
//! Public operations of [`Client`] never fail. Errors are logged, reported once per operation and
//! error kind to the configured [`Telemetry`], and a default value is returned instead. The
//! underlying failures are represented by the [`Error`] enum.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `statsig` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! ```no_run
//! # use statsig::{ClientConfig, StatsigUser};
//! # async fn example() -> statsig::Result<()> {
//! let client = ClientConfig::from_sdk_key("client-key")
//!     .to_client(StatsigUser::with_user_id("a-user").with_email("user@example.com"))?;
//! client.initialize().await;
//!
//! let experiment = client.get_experiment("checkout_flow", true);
//! let steps: i64 = experiment.get("steps", 3);
//!
//! client.log_event("purchase", Some(19.99.into()), None);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod clock;
mod config;
mod dynamic_config;
mod error;
mod error_boundary;
mod evaluation;
mod exposure;
pub mod hashing;
mod identity;
mod layer;
mod network;
mod storage;
pub mod store;
mod user;
mod value;

pub use client::{Client, MAX_PREFETCH_USERS};
pub use clock::{Clock, SystemClock};
pub use config::ClientConfig;
pub use dynamic_config::{DynamicConfig, FeatureGate};
pub use error::{Error, Result};
pub use error_boundary::{ErrorReport, Telemetry};
pub use evaluation::{
    EvaluationDetails, EvaluationKind, EvaluationReason, EvaluationRecord, HashAlgorithm,
    SecondaryExposure,
};
pub use exposure::{EventBatch, EventLogger, EventValue, LogEvent};
pub use hashing::{get_user_cache_key, UserCacheKey};
pub use identity::StatsigMetadata;
pub use layer::{Layer, LayerExposureCallback, Provenance};
pub use network::{FetchRequest, Fetcher, HttpFetcher};
pub use storage::{AsyncKeyValueStorage, InMemoryStorage, KeyValueStorage, Storage};
pub use store::StatsigOverrides;
pub use user::{StatsigEnvironment, StatsigUser};
pub use value::ParamValue;
