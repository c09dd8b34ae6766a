use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    dynamic_config::{DynamicConfig, FeatureGate},
    error_boundary::ErrorBoundary,
    evaluation::{EvaluationDetails, EvaluationKind, EvaluationReason, EvaluationRecord},
    exposure::{EventLogger, EventValue, ExposureContext, ExposureLogger, NoopEventLogger},
    hashing::UserCacheKey,
    identity::{user_hash, Identity},
    layer::{Layer, LayerExposureCallback},
    network::{FetchRequest, Fetcher, HttpEventLogger, HttpFetcher},
    storage::{Storage, INTERNAL_STORE_KEY, STABLE_ID_KEY},
    store::{EvaluationStore, Resolution, ResolveOptions, SaveOutcome, StatsigOverrides},
    user::StatsigEnvironment,
    ClientConfig, Clock, Error, Result, StatsigUser,
};

const SDK_KEY_PREFIX: &str = "client-";
/// Maximum number of users fetched by a single prefetch call. Excess users are dropped.
pub const MAX_PREFETCH_USERS: usize = 5;

/// A client for Statsig.
///
/// `Client` is a cheap handle: clones share the same cache, event buffer, and in-flight fetch.
/// Reads are synchronous and served from memory. They never fail; on error the default value is
/// returned and the failure is reported to [`Telemetry`](crate::Telemetry).
///
/// `initialize()`, `update_user()`, and `prefetch_users()` must be awaited within a tokio
/// runtime.
///
/// # Examples
/// ```no_run
/// # use statsig::{ClientConfig, StatsigUser};
/// # async fn example() -> statsig::Result<()> {
/// let client = ClientConfig::from_sdk_key("client-key").to_client(StatsigUser::with_user_id("a-user"))?;
/// client.initialize().await;
///
/// if client.check_gate("new_homepage") {
///     let layer = client.get_layer("homepage", false);
///     let title: String = layer.get("title", "Welcome".to_owned());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    environment: Option<StatsigEnvironment>,
    local_mode: bool,
    init_timeout: Duration,
    logging_interval: Duration,
    prefetch_users: Vec<StatsigUser>,
    clock: Arc<dyn Clock + Send + Sync>,
    fetcher: Option<Arc<dyn Fetcher>>,
    storage: Option<Storage>,
    boundary: ErrorBoundary,
    logger: ExposureLogger,
    /// Lock order: `identity` before `store`.
    identity: Mutex<Identity>,
    store: Mutex<EvaluationStore>,
    /// Cache key (`v1`) of every prefetched user.
    prefetched: Mutex<HashSet<String>>,
    /// Serializes fetch-and-save sequences, so saves are applied in request order.
    fetch_lock: tokio::sync::Mutex<()>,
    /// Set once `initialize()` was first called. Holds `true` when the initialization finished.
    initialization: Mutex<Option<watch::Receiver<bool>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a new `Client` for `user`.
    ///
    /// Synchronous storage and initialize values are applied immediately, so reads may be served
    /// before `initialize()` completes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSdkKey`] unless `config` holds a client SDK key.
    /// [`Error::InvalidBaseUrl`] if a configured API URL cannot be parsed.
    pub fn new(config: ClientConfig, user: StatsigUser) -> Result<Client> {
        let ClientConfig {
            sdk_key,
            api,
            event_logging_api,
            environment,
            logging_buffer_max_size,
            logging_interval,
            override_stable_id,
            local_mode,
            init_timeout,
            initialize_values,
            prefetch_users,
            disable_local_storage,
            disable_overrides,
            fetcher,
            storage,
            telemetry,
            event_logger,
            clock,
        } = config;

        if !sdk_key.starts_with(SDK_KEY_PREFIX) {
            return Err(Error::InvalidSdkKey);
        }

        let boundary = ErrorBoundary::new(&sdk_key, telemetry);
        let storage = if disable_local_storage { None } else { storage };

        let mut identity = Identity::new(user.normalized(environment.as_ref()), override_stable_id);
        let mut store = EvaluationStore::new(identity.cache_key(), Arc::clone(&clock));
        if disable_overrides {
            store.disable_overrides();
        }

        if let Some(Storage::Sync(storage)) = &storage {
            if let Some(stable_id) = identity.adopt_stable_id(storage.get(STABLE_ID_KEY)) {
                if let Err(err) = storage.set(STABLE_ID_KEY, &stable_id) {
                    boundary.report("persistStableId", &err);
                }
            }
            store.rekey_current(identity.cache_key());

            let loaded = storage
                .get(INTERNAL_STORE_KEY)
                .and_then(|persisted| store.load_persisted(persisted.as_deref()));
            if let Err(err) = loaded {
                store.mark_loaded();
                boundary.report("loadStorage", &err);
            }
        }

        if let Some(values) = initialize_values {
            let bootstrapped =
                user_hash(identity.user()).and_then(|user_hash| store.bootstrap(&user_hash, values));
            if let Err(err) = bootstrapped {
                boundary.report("setInitializeValues", &err);
            }
        }

        let fetcher: Option<Arc<dyn Fetcher>> = match (local_mode, fetcher) {
            (true, _) => None,
            (false, Some(fetcher)) => Some(fetcher),
            (false, None) => Some(Arc::new(HttpFetcher::new(&api, &sdk_key, Arc::clone(&clock))?)),
        };

        let event_logger: Arc<dyn EventLogger + Send + Sync> = match (local_mode, event_logger) {
            (_, Some(event_logger)) => event_logger,
            (true, None) => Arc::new(NoopEventLogger),
            (false, None) => Arc::new(HttpEventLogger::new(
                &event_logging_api,
                &sdk_key,
                Arc::clone(&clock),
            )?),
        };
        let logger = ExposureLogger::new(
            logging_buffer_max_size,
            identity.metadata(),
            event_logger,
            Arc::clone(&clock),
        );

        log::debug!(target: "statsig", local_mode = local_mode, stable_id = identity.stable_id(); "created client");

        Ok(Client {
            inner: Arc::new(Inner {
                environment,
                local_mode,
                init_timeout,
                logging_interval,
                prefetch_users,
                clock,
                fetcher,
                storage,
                boundary,
                logger,
                identity: Mutex::new(identity),
                store: Mutex::new(store),
                prefetched: Mutex::new(HashSet::new()),
                fetch_lock: tokio::sync::Mutex::new(()),
                initialization: Mutex::new(None),
                flush_task: Mutex::new(None),
            }),
        })
    }

    /// Load asynchronous storage and fetch values for the current user.
    ///
    /// Returns when values were fetched, or when the init timeout elapsed, whichever comes first.
    /// A fetch that outlives the timeout is still applied when it completes. Concurrent and
    /// repeated calls share the same initialization.
    pub async fn initialize(&self) {
        let inner = &self.inner;
        let receiver = inner.boundary.capture(
            "initialize",
            || {
                let mut initialization = lock(&inner.initialization, "initialization")?;
                if let Some(receiver) = &*initialization {
                    return Ok(Some(receiver.clone()));
                }

                let (sender, receiver) = watch::channel(false);
                *initialization = Some(receiver.clone());
                let task_inner = Arc::clone(inner);
                tokio::spawn(async move {
                    task_inner.run_initialize().await;
                    // Receivers may all be gone. Nothing to notify then.
                    let _ = sender.send(true);
                });
                Ok(Some(receiver))
            },
            || None,
        );

        if let Some(mut receiver) = receiver {
            match tokio::time::timeout(inner.init_timeout, receiver.wait_for(|done| *done)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {
                    inner.boundary.report(
                        "initialize",
                        &Error::Panicked("initialization task stopped".to_owned()),
                    );
                }
                Err(_) => {
                    log::warn!(target: "statsig", timeout:? = inner.init_timeout; "initialize timed out, serving values from memory");
                }
            }
        }

        inner
            .boundary
            .swallow("initialize", || lock(&inner.store, "store").map(|mut store| store.mark_loaded()));
        inner.start_flush_task();
    }

    /// Apply initialize values for the current user, e.g. values generated by a server SDK.
    pub fn set_initialize_values(&self, values: Value) {
        let inner = &self.inner;
        inner.boundary.swallow("setInitializeValues", || {
            let user_hash = user_hash(lock(&inner.identity, "identity")?.user())?;
            lock(&inner.store, "store")?.bootstrap(&user_hash, values)
        });
    }

    /// Switch to `user`.
    ///
    /// Cached values of `user` are served immediately. Unless `user` was prefetched, fresh values
    /// are fetched after any fetch already in flight.
    pub async fn update_user(&self, user: StatsigUser) {
        let inner = &self.inner;
        let task = async {
            let user = user.normalized(inner.environment.as_ref());
            let key = {
                let mut identity = lock(&inner.identity, "identity")?;
                identity.set_user(user.clone());
                identity.cache_key()
            };
            inner.logger.reset_dedupe_keys()?;

            let is_prefetched = lock(&inner.prefetched, "prefetched")?.contains(&key.v1);
            let found = lock(&inner.store, "store")?.update_user(key.clone(), is_prefetched);
            if found && is_prefetched {
                return Ok(());
            }
            inner.fetch_and_save(user, key, false).await
        };
        inner.boundary.swallow_async("updateUser", task).await;
    }

    /// Fetch values for `users` without switching to them. At most
    /// [`MAX_PREFETCH_USERS`] users are fetched; the rest are dropped with a warning.
    pub async fn prefetch_users(&self, users: Vec<StatsigUser>) {
        self.inner.prefetch(users).await;
    }

    /// Value of gate `name`, logging an exposure.
    pub fn check_gate(&self, name: &str) -> bool {
        self.feature_gate("checkGate", name, true).value
    }

    /// Value of gate `name` without logging an exposure.
    pub fn check_gate_with_exposure_logging_disabled(&self, name: &str) -> bool {
        self.feature_gate("checkGateWithExposureLoggingDisabled", name, false)
            .value
    }

    /// Gate `name` with its rule and evaluation details, logging an exposure.
    pub fn get_feature_gate(&self, name: &str) -> FeatureGate {
        self.feature_gate("getFeatureGate", name, true)
    }

    /// Dynamic config `name`, logging an exposure.
    pub fn get_config(&self, name: &str) -> DynamicConfig {
        self.dynamic_config("getConfig", EvaluationKind::Config, name, false, true)
    }

    /// Dynamic config `name` without logging an exposure.
    pub fn get_config_with_exposure_logging_disabled(&self, name: &str) -> DynamicConfig {
        self.dynamic_config(
            "getConfigWithExposureLoggingDisabled",
            EvaluationKind::Config,
            name,
            false,
            false,
        )
    }

    /// Experiment `name`, logging an exposure.
    ///
    /// With `keep_device_value`, the first value read while the user is in an active experiment is
    /// pinned to the device and served until the user changes or the value is removed with
    /// [`remove_sticky_value`](Self::remove_sticky_value).
    pub fn get_experiment(&self, name: &str, keep_device_value: bool) -> DynamicConfig {
        self.dynamic_config(
            "getExperiment",
            EvaluationKind::Experiment,
            name,
            keep_device_value,
            true,
        )
    }

    /// Experiment `name` without logging an exposure.
    pub fn get_experiment_with_exposure_logging_disabled(
        &self,
        name: &str,
        keep_device_value: bool,
    ) -> DynamicConfig {
        self.dynamic_config(
            "getExperimentWithExposureLoggingDisabled",
            EvaluationKind::Experiment,
            name,
            keep_device_value,
            false,
        )
    }

    /// Layer `name`. Exposures are logged per parameter read, see [`Layer`].
    pub fn get_layer(&self, name: &str, keep_device_value: bool) -> Layer {
        self.layer("getLayer", name, keep_device_value, true)
    }

    /// Layer `name`. Parameter reads never log exposures.
    pub fn get_layer_with_exposure_logging_disabled(
        &self,
        name: &str,
        keep_device_value: bool,
    ) -> Layer {
        self.layer(
            "getLayerWithExposureLoggingDisabled",
            name,
            keep_device_value,
            false,
        )
    }

    /// Log an exposure of gate `name`, e.g. after reading it with exposure logging disabled.
    ///
    /// Manual exposures report the fetched value, ignoring local overrides.
    pub fn log_gate_exposure(&self, name: &str) {
        let inner = &self.inner;
        inner.boundary.swallow("logGateExposure", || {
            let resolution = inner.resolve(EvaluationKind::Gate, name, manual_options(false))?;
            inner.log_gate_exposure(name, &resolution, true)
        });
    }

    /// Log a manual exposure for dynamic config `name`.
    pub fn log_config_exposure(&self, name: &str) {
        self.log_config_exposure_of("logConfigExposure", EvaluationKind::Config, name, false);
    }

    /// Log a manual exposure for experiment `name`.
    pub fn log_experiment_exposure(&self, name: &str, keep_device_value: bool) {
        self.log_config_exposure_of(
            "logExperimentExposure",
            EvaluationKind::Experiment,
            name,
            keep_device_value,
        );
    }

    /// Log an exposure of `parameter` of layer `name`.
    pub fn log_layer_parameter_exposure(&self, name: &str, parameter: &str, keep_device_value: bool) {
        let inner = &self.inner;
        inner.boundary.swallow("logLayerParameterExposure", || {
            let resolution = inner.resolve(
                EvaluationKind::Layer,
                name,
                manual_options(keep_device_value),
            )?;
            let layer = Layer::new(name, resolution.record, resolution.details, None);
            let (user, cache_key) = inner.current()?;
            let context = ExposureContext {
                user: &user,
                cache_key: &cache_key,
            };
            inner.logger.log_layer_exposure(context, &layer, parameter, true)?;
            Ok(())
        });
    }

    /// Log a custom event for the current user.
    ///
    /// Name and string value are truncated to 64 characters. Metadata larger than 2048 bytes is
    /// replaced by an error marker.
    pub fn log_event(
        &self,
        name: &str,
        value: Option<EventValue>,
        metadata: Option<HashMap<String, String>>,
    ) {
        let inner = &self.inner;
        inner.boundary.swallow("logEvent", || {
            let user = lock(&inner.identity, "identity")?.user().clone();
            let metadata = metadata.map(|metadata| metadata.into_iter().collect::<BTreeMap<_, _>>());
            inner.logger.log_custom_event(&user, name, value, metadata)
        });
    }

    /// Serve `value` for gate `name` until the override is removed.
    pub fn override_gate(&self, name: &str, value: bool) {
        self.with_store("overrideGate", |store| {
            validate_name(name)?;
            store.set_gate_override(name, value);
            Ok(())
        });
    }

    /// Serve `value` for dynamic config or experiment `name` until the override is removed.
    pub fn override_config(&self, name: &str, value: Map<String, Value>) {
        self.with_store("overrideConfig", |store| {
            validate_name(name)?;
            store.set_config_override(name, value);
            Ok(())
        });
    }

    /// Serve `value` for layer `name` until the override is removed.
    pub fn override_layer(&self, name: &str, value: Map<String, Value>) {
        self.with_store("overrideLayer", |store| {
            validate_name(name)?;
            store.set_layer_override(name, value);
            Ok(())
        });
    }

    /// Remove the override of gate `name`, or all gate overrides if `name` is `None`.
    pub fn remove_gate_override(&self, name: Option<&str>) {
        self.with_store("removeGateOverride", |store| {
            store.remove_gate_override(name);
            Ok(())
        });
    }

    /// Remove the override of config `name`, or all config overrides if `name` is `None`.
    pub fn remove_config_override(&self, name: Option<&str>) {
        self.with_store("removeConfigOverride", |store| {
            store.remove_config_override(name);
            Ok(())
        });
    }

    /// Remove the override of layer `name`, or all layer overrides if `name` is `None`.
    pub fn remove_layer_override(&self, name: Option<&str>) {
        self.with_store("removeLayerOverride", |store| {
            store.remove_layer_override(name);
            Ok(())
        });
    }

    /// Copy of all local overrides.
    pub fn get_all_overrides(&self) -> StatsigOverrides {
        let inner = &self.inner;
        inner.boundary.capture(
            "getAllOverrides",
            || Ok(lock(&inner.store, "store")?.all_overrides()),
            StatsigOverrides::default,
        )
    }

    /// Release the device-pinned value of experiment or layer `name` for the current user.
    pub fn remove_sticky_value(&self, name: &str) {
        let inner = &self.inner;
        self.with_store("removeStickyValue", |store| {
            if store.remove_sticky_value(name) {
                inner.persist(store)?;
            }
            Ok(())
        });
    }

    /// Reason and time of the values currently served for the current user.
    pub fn evaluation_details(&self) -> EvaluationDetails {
        let inner = &self.inner;
        inner.boundary.capture(
            "getEvaluationDetails",
            || Ok(lock(&inner.store, "store")?.evaluation_details()),
            || inner.error_details(),
        )
    }

    /// Stable ID of this device.
    pub fn get_stable_id(&self) -> String {
        let inner = &self.inner;
        inner.boundary.capture(
            "getStableID",
            || Ok(lock(&inner.identity, "identity")?.stable_id().to_owned()),
            String::new,
        )
    }

    /// The current user, normalized with the configured environment.
    pub fn get_current_user(&self) -> StatsigUser {
        let inner = &self.inner;
        inner.boundary.capture(
            "getCurrentUser",
            || Ok(lock(&inner.identity, "identity")?.user().clone()),
            StatsigUser::default,
        )
    }

    /// Hand all buffered events to the event logger.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Stop periodic flushing and flush buffered events.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.boundary.swallow("shutdown", || {
            if let Some(task) = lock(&inner.flush_task, "flush task")?.take() {
                task.abort();
            }
            Ok(())
        });
        inner.flush();
        log::debug!(target: "statsig", "client shut down");
    }

    fn feature_gate(&self, tag: &str, name: &str, log_exposure: bool) -> FeatureGate {
        let inner = &self.inner;
        inner.boundary.capture(
            tag,
            || {
                let resolution =
                    inner.resolve(EvaluationKind::Gate, name, ResolveOptions::default())?;
                if log_exposure {
                    inner
                        .boundary
                        .swallow("logGateExposure", || inner.log_gate_exposure(name, &resolution, false));
                }
                Ok(FeatureGate::new(name, &resolution.record, resolution.details))
            },
            || {
                FeatureGate::new(
                    name,
                    &EvaluationRecord::unrecognized(EvaluationKind::Gate, name),
                    inner.error_details(),
                )
            },
        )
    }

    fn dynamic_config(
        &self,
        tag: &str,
        kind: EvaluationKind,
        name: &str,
        keep_device_value: bool,
        log_exposure: bool,
    ) -> DynamicConfig {
        let inner = &self.inner;
        inner.boundary.capture(
            tag,
            || {
                let resolution = inner.resolve(kind, name, read_options(keep_device_value))?;
                if log_exposure {
                    inner.boundary.swallow("logConfigExposure", || {
                        inner.log_config_exposure(kind, name, &resolution, false)
                    });
                }
                Ok(DynamicConfig::new(name, resolution.record, resolution.details))
            },
            || {
                DynamicConfig::new(
                    name,
                    Arc::new(EvaluationRecord::unrecognized(kind, name)),
                    inner.error_details(),
                )
            },
        )
    }

    fn layer(&self, tag: &str, name: &str, keep_device_value: bool, log_exposure: bool) -> Layer {
        let inner = &self.inner;
        inner.boundary.capture(
            tag,
            || {
                let resolution =
                    inner.resolve(EvaluationKind::Layer, name, read_options(keep_device_value))?;
                let on_exposure = if log_exposure {
                    Some(self.layer_exposure_callback()?)
                } else {
                    None
                };
                Ok(Layer::new(name, resolution.record, resolution.details, on_exposure))
            },
            || {
                Layer::new(
                    name,
                    Arc::new(EvaluationRecord::unrecognized(EvaluationKind::Layer, name)),
                    inner.error_details(),
                    None,
                )
            },
        )
    }

    /// Exposure callback bound to the current user. Holds the client weakly.
    fn layer_exposure_callback(&self) -> Result<LayerExposureCallback> {
        let (user, cache_key) = self.inner.current()?;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Arc::new(move |layer: &Layer, parameter: &str| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.boundary.swallow("logLayerExposure", || {
                let context = ExposureContext {
                    user: &user,
                    cache_key: &cache_key,
                };
                inner
                    .logger
                    .log_layer_exposure(context, layer, parameter, false)?;
                Ok(())
            });
        }))
    }

    fn log_config_exposure_of(
        &self,
        tag: &str,
        kind: EvaluationKind,
        name: &str,
        keep_device_value: bool,
    ) {
        let inner = &self.inner;
        inner.boundary.swallow(tag, || {
            let resolution = inner.resolve(kind, name, manual_options(keep_device_value))?;
            inner.log_config_exposure(kind, name, &resolution, true)
        });
    }

    fn with_store(&self, tag: &str, task: impl FnOnce(&mut EvaluationStore) -> Result<()>) {
        let inner = &self.inner;
        inner.boundary.swallow(tag, || {
            let mut store = lock(&inner.store, "store")?;
            task(&mut store)
        });
    }
}

impl Inner {
    /// Current user and its cache key.
    fn current(&self) -> Result<(StatsigUser, UserCacheKey)> {
        let identity = lock(&self.identity, "identity")?;
        Ok((identity.user().clone(), identity.cache_key()))
    }

    fn resolve(&self, kind: EvaluationKind, name: &str, options: ResolveOptions) -> Result<Resolution> {
        validate_name(name)?;
        let mut store = lock(&self.store, "store")?;
        let (resolution, captured) = store.resolve_mut(kind, name, options)?;
        if captured {
            if let Err(err) = self.persist(&store) {
                self.boundary.report("persistStickyValue", &err);
            }
        }
        Ok(resolution)
    }

    fn log_gate_exposure(&self, name: &str, resolution: &Resolution, is_manual: bool) -> Result<()> {
        let (user, cache_key) = self.current()?;
        let context = ExposureContext {
            user: &user,
            cache_key: &cache_key,
        };
        self.logger
            .log_gate_exposure(context, name, &resolution.record, resolution.details, is_manual)?;
        Ok(())
    }

    fn log_config_exposure(
        &self,
        kind: EvaluationKind,
        name: &str,
        resolution: &Resolution,
        is_manual: bool,
    ) -> Result<()> {
        let (user, cache_key) = self.current()?;
        let context = ExposureContext {
            user: &user,
            cache_key: &cache_key,
        };
        self.logger.log_config_exposure(
            context,
            kind,
            name,
            &resolution.record,
            resolution.details,
            is_manual,
        )?;
        Ok(())
    }

    /// Write the cache rows to storage, if any is configured.
    fn persist(&self, store: &EvaluationStore) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        storage.set_detached(INTERNAL_STORE_KEY, store.persisted_snapshot()?)
    }

    fn error_details(&self) -> EvaluationDetails {
        EvaluationDetails::new(EvaluationReason::Error, self.clock.now_millis())
    }

    fn flush(&self) {
        self.boundary.swallow("flush", || self.logger.flush());
    }

    async fn run_initialize(&self) {
        if let Some(storage @ Storage::Async(_)) = &self.storage {
            self.boundary
                .swallow_async("loadStorage", self.load_async_storage(storage))
                .await;
        }

        if self.local_mode {
            log::debug!(target: "statsig", "local mode, skipping fetch");
        } else {
            let task = async {
                let (user, cache_key) = self.current()?;
                self.fetch_and_save(user, cache_key, false).await
            };
            self.boundary.swallow_async("initialize", task).await;
        }

        self.boundary
            .swallow("initialize", || lock(&self.store, "store").map(|mut store| store.mark_loaded()));

        if !self.prefetch_users.is_empty() {
            self.prefetch(self.prefetch_users.clone()).await;
        }
    }

    /// Adopt the persisted stable ID and merge persisted rows. The store is marked loaded even if
    /// storage fails.
    async fn load_async_storage(&self, storage: &Storage) -> Result<()> {
        let persisted_stable_id = storage.get(STABLE_ID_KEY).await;
        let (write_back, cache_key, metadata) = {
            let mut identity = lock(&self.identity, "identity")?;
            let write_back = identity.adopt_stable_id(persisted_stable_id);
            (write_back, identity.cache_key(), identity.metadata())
        };
        if let Some(stable_id) = write_back {
            if let Err(err) = storage.set(STABLE_ID_KEY, &stable_id).await {
                self.boundary.report("persistStableId", &err);
            }
        }
        self.logger.set_metadata(metadata)?;
        lock(&self.store, "store")?.rekey_current(cache_key);

        let persisted = storage.get(INTERNAL_STORE_KEY).await;
        let mut store = lock(&self.store, "store")?;
        match persisted {
            Ok(persisted) => store.load_persisted(persisted.as_deref()),
            Err(err) => {
                store.mark_loaded();
                Err(err)
            }
        }
    }

    /// Fetch values for `user` and save them under `cache_key`. Waits for any fetch in flight.
    async fn fetch_and_save(
        &self,
        user: StatsigUser,
        cache_key: UserCacheKey,
        is_prefetch: bool,
    ) -> Result<()> {
        let Some(fetcher) = &self.fetcher else {
            return Ok(());
        };
        let _in_flight = self.fetch_lock.lock().await;

        let user_hash = user_hash(&user)?;
        let since_time = if is_prefetch {
            None
        } else {
            lock(&self.store, "store")?.last_update_time(&cache_key, &user_hash)
        };
        let statsig_metadata = lock(&self.identity, "identity")?.metadata();
        let request = FetchRequest {
            user,
            since_time,
            statsig_metadata,
        };

        log::debug!(target: "statsig", key:display = cache_key.v1, since_time:? = since_time, is_prefetch = is_prefetch; "fetching values");
        let payload = fetcher.fetch_values(&request).await?;

        let mut store = lock(&self.store, "store")?;
        let outcome = store.save(&cache_key, &user_hash, payload)?;
        log::debug!(target: "statsig", key:display = cache_key.v1, outcome:? = outcome; "fetched values");
        if outcome == SaveOutcome::Updated {
            self.persist(&store)?;
        }
        Ok(())
    }

    async fn prefetch(&self, mut users: Vec<StatsigUser>) {
        if users.len() > MAX_PREFETCH_USERS {
            log::warn!(target: "statsig", count = users.len(); "cannot prefetch more than {MAX_PREFETCH_USERS} users, dropping the rest");
            users.truncate(MAX_PREFETCH_USERS);
        }

        for user in users {
            let task = async {
                let user = user.normalized(self.environment.as_ref());
                let cache_key = lock(&self.identity, "identity")?.cache_key_for(&user);
                lock(&self.prefetched, "prefetched")?.insert(cache_key.v1.clone());
                self.fetch_and_save(user, cache_key, true).await
            };
            self.boundary.swallow_async("prefetchUsers", task).await;
        }
    }

    /// Flush buffered events every `logging_interval`, for as long as the client is alive.
    fn start_flush_task(self: &Arc<Self>) {
        self.boundary.swallow("startFlushTask", || {
            let mut flush_task = lock(&self.flush_task, "flush task")?;
            if flush_task.is_some() {
                return Ok(());
            }

            let inner = Arc::downgrade(self);
            let mut interval = tokio::time::interval(self.logging_interval);
            *flush_task = Some(tokio::spawn(async move {
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    inner.flush();
                }
            }));
            Ok(())
        });
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Panicked(format!("{name} lock poisoned")))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("name must not be empty".to_owned()));
    }
    Ok(())
}

fn read_options(keep_device_value: bool) -> ResolveOptions {
    ResolveOptions {
        ignore_overrides: false,
        keep_device_value,
    }
}

fn manual_options(keep_device_value: bool) -> ResolveOptions {
    ResolveOptions {
        ignore_overrides: true,
        keep_device_value,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{hashing::sha256_hash, storage::InMemoryStorage};

    fn local_config() -> ClientConfig {
        ClientConfig::from_sdk_key("client-key")
            .with_local_mode(true)
            .with_override_stable_id("stable")
            .with_clock(|| 100i64)
    }

    fn bootstrap_values() -> Value {
        json!({
            "feature_gates": {
                sha256_hash("a_gate"): {"name": sha256_hash("a_gate"), "value": true, "rule_id": "r"}
            },
            "dynamic_configs": {
                sha256_hash("a_config"): {"name": sha256_hash("a_config"), "value": {"k": "v"}, "rule_id": "c"}
            },
            "has_updates": true,
            "time": 5
        })
    }

    #[test]
    fn rejects_server_keys() {
        let result = ClientConfig::from_sdk_key("secret-key").to_client(StatsigUser::default());

        assert!(matches!(result, Err(Error::InvalidSdkKey)));
    }

    #[test]
    fn reads_before_initialize_fall_back() {
        let client = local_config().to_client(StatsigUser::default()).unwrap();

        assert!(!client.check_gate("a_gate"));
        let config = client.get_config("a_config");
        assert_eq!(config.evaluation_details(), EvaluationDetails::new(EvaluationReason::Error, 100));
        assert!(config.value().is_empty());
    }

    #[test]
    fn bootstrapped_client_serves_values() {
        let client = local_config()
            .with_initialize_values(bootstrap_values())
            .to_client(StatsigUser::with_user_id("a"))
            .unwrap();

        assert!(client.check_gate("a_gate"));
        assert_eq!(client.get_config("a_config").get("k", String::new()), "v");
        assert_eq!(
            client.evaluation_details(),
            EvaluationDetails::new(EvaluationReason::Bootstrap, 5)
        );
    }

    #[test]
    fn empty_names_fall_back() {
        let reports: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let telemetry = {
            let reports = Arc::clone(&reports);
            move |report: &crate::ErrorReport| reports.lock().unwrap().push(report.kind)
        };
        let client = local_config()
            .with_initialize_values(bootstrap_values())
            .with_telemetry(telemetry)
            .to_client(StatsigUser::default())
            .unwrap();

        assert!(!client.check_gate(""));
        assert_eq!(*reports.lock().unwrap(), vec!["InvalidArgument"]);
    }

    #[test]
    fn overrides_apply_and_can_be_removed() {
        let client = local_config()
            .with_initialize_values(bootstrap_values())
            .to_client(StatsigUser::default())
            .unwrap();

        client.override_gate("a_gate", false);
        assert!(!client.check_gate("a_gate"));
        assert_eq!(
            client.get_feature_gate("a_gate").details.reason,
            EvaluationReason::LocalOverride
        );

        client.remove_gate_override(None);
        assert!(client.check_gate("a_gate"));
        assert_eq!(client.get_all_overrides(), StatsigOverrides::default());
    }

    #[test]
    fn sync_storage_is_loaded_at_construction() {
        let storage = Arc::new(InMemoryStorage::new());
        let first = local_config()
            .with_initialize_values(bootstrap_values())
            .with_storage(Storage::Sync(storage.clone()))
            .to_client(StatsigUser::with_user_id("a"))
            .unwrap();
        assert_eq!(first.get_stable_id(), "stable");

        let second = ClientConfig::from_sdk_key("client-key")
            .with_local_mode(true)
            .with_storage(Storage::Sync(storage.clone()))
            .to_client(StatsigUser::with_user_id("a"))
            .unwrap();

        assert_eq!(second.get_stable_id(), "stable");
        // Bootstrap values are not persisted.
        assert_eq!(
            second.evaluation_details().reason,
            EvaluationReason::Uninitialized
        );
    }
}
