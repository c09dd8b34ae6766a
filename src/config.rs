use std::{sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    clock::SystemClock,
    error_boundary::NoopTelemetry,
    exposure::DEFAULT_BUFFER_SIZE,
    network::Fetcher,
    storage::Storage,
    user::StatsigEnvironment,
    Client, Clock, EventLogger, Result, StatsigUser, Telemetry,
};

const MIN_LOGGING_INTERVAL: Duration = Duration::from_secs(1);
const MAX_LOGGING_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use statsig::{ClientConfig, StatsigUser};
/// let client = ClientConfig::from_sdk_key("client-key")
///     .with_init_timeout(Duration::from_secs(1))
///     .with_event_logger(|batch: statsig::EventBatch| {
///         println!("{:?}", batch);
///     })
///     .to_client(StatsigUser::with_user_id("a-user"));
/// ```
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) api: String,
    pub(crate) event_logging_api: String,
    pub(crate) environment: Option<StatsigEnvironment>,
    pub(crate) logging_buffer_max_size: usize,
    pub(crate) logging_interval: Duration,
    pub(crate) override_stable_id: Option<String>,
    pub(crate) local_mode: bool,
    pub(crate) init_timeout: Duration,
    pub(crate) initialize_values: Option<Value>,
    pub(crate) prefetch_users: Vec<StatsigUser>,
    pub(crate) disable_local_storage: bool,
    pub(crate) disable_overrides: bool,
    pub(crate) fetcher: Option<Arc<dyn Fetcher>>,
    pub(crate) storage: Option<Storage>,
    pub(crate) telemetry: Arc<dyn Telemetry + Send + Sync>,
    pub(crate) event_logger: Option<Arc<dyn EventLogger + Send + Sync>>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
}

impl ClientConfig {
    /// Default base URL of the initialize endpoint.
    pub const DEFAULT_API: &'static str = "https://featuregates.org/v1/";
    /// Default base URL of the event logging endpoint.
    pub const DEFAULT_EVENT_LOGGING_API: &'static str = "https://events.statsigapi.net/v1/";
    /// Default interval between scheduled event flushes.
    pub const DEFAULT_LOGGING_INTERVAL: Duration = Duration::from_secs(10);
    /// Default time [`Client::initialize`](crate::Client::initialize) waits for the network.
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create a default configuration using the specified client SDK key.
    ///
    /// ```
    /// # use statsig::ClientConfig;
    /// ClientConfig::from_sdk_key("client-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            api: ClientConfig::DEFAULT_API.to_owned(),
            event_logging_api: ClientConfig::DEFAULT_EVENT_LOGGING_API.to_owned(),
            environment: None,
            logging_buffer_max_size: DEFAULT_BUFFER_SIZE,
            logging_interval: ClientConfig::DEFAULT_LOGGING_INTERVAL,
            override_stable_id: None,
            local_mode: false,
            init_timeout: ClientConfig::DEFAULT_INIT_TIMEOUT,
            initialize_values: None,
            prefetch_users: Vec::new(),
            disable_local_storage: false,
            disable_overrides: false,
            fetcher: None,
            storage: None,
            telemetry: Arc::new(NoopTelemetry),
            event_logger: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override base URL of the initialize endpoint. A trailing `/` is added if missing.
    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = with_trailing_slash(api.into());
        self
    }

    /// Override base URL of the event logging endpoint. A trailing `/` is added if missing.
    pub fn with_event_logging_api(mut self, api: impl Into<String>) -> Self {
        self.event_logging_api = with_trailing_slash(api.into());
        self
    }

    /// Environment attached to every user, e.g. `{"tier": "staging"}`.
    pub fn with_environment(mut self, environment: StatsigEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Number of buffered events that triggers a flush. Clamped to `2..=500`.
    pub fn with_logging_buffer_max_size(mut self, size: usize) -> Self {
        self.logging_buffer_max_size = size;
        self
    }

    /// Interval of periodic event flushes. Clamped to 1 to 60 seconds.
    pub fn with_logging_interval(mut self, interval: Duration) -> Self {
        self.logging_interval = interval.clamp(MIN_LOGGING_INTERVAL, MAX_LOGGING_INTERVAL);
        self
    }

    /// Use `stable_id` instead of a generated or persisted one.
    pub fn with_override_stable_id(mut self, stable_id: impl Into<String>) -> Self {
        self.override_stable_id = Some(stable_id.into());
        self
    }

    /// Never touch the network. Values come from bootstrap, cache, and overrides only.
    pub fn with_local_mode(mut self, local_mode: bool) -> Self {
        self.local_mode = local_mode;
        self
    }

    /// How long `initialize()` waits for the first fetch before serving what is in memory.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Initialize response to hydrate from synchronously, e.g. values generated by a server SDK.
    pub fn with_initialize_values(mut self, values: Value) -> Self {
        self.initialize_values = Some(values);
        self
    }

    /// Users to fetch values for during `initialize()`, so that switching to them is instant.
    pub fn with_prefetch_users(mut self, users: Vec<StatsigUser>) -> Self {
        self.prefetch_users = users;
        self
    }

    /// Ignore the configured storage. Nothing is read or persisted.
    pub fn with_disable_local_storage(mut self, disable: bool) -> Self {
        self.disable_local_storage = disable;
        self
    }

    /// Ignore local overrides.
    pub fn with_disable_overrides(mut self, disable: bool) -> Self {
        self.disable_overrides = disable;
        self
    }

    /// Replace the HTTP fetcher.
    pub fn with_fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Persist cached values and the stable ID in `storage`.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Receive reports of failures absorbed by the SDK.
    pub fn with_telemetry(mut self, telemetry: impl Telemetry + Send + Sync + 'static) -> Self {
        self.telemetry = Arc::new(telemetry);
        self
    }

    /// Receive event batches instead of sending them to the event logging endpoint.
    pub fn with_event_logger(
        mut self,
        event_logger: impl EventLogger + Send + Sync + 'static,
    ) -> Self {
        self.event_logger = Some(Arc::new(event_logger));
        self
    }

    /// Clock used for event and evaluation timestamps.
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Create a new [`Client`] for `user` using the specified configuration.
    pub fn to_client(self, user: StatsigUser) -> Result<Client> {
        Client::new(self, user)
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}
