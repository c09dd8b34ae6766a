use std::sync::Arc;

/// Represents a result type for operations in the Statsig SDK.
///
/// Internal components return this type and never decide on fallback values themselves. The
/// conversion of an error into a safe default happens once, in
/// [`ErrorBoundary`](crate::error_boundary::ErrorBoundary).
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Statsig SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A name or argument passed by the caller is not usable (e.g., an empty gate name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The evaluation store was read before any bootstrap, cache, or network values were applied.
    #[error("evaluation store is not loaded yet, call and wait for initialize() first")]
    NotLoaded,

    /// A payload (network response, bootstrap values, or persisted cache) did not have the
    /// expected shape.
    #[error("malformed payload")]
    MalformedPayload(#[source] Arc<serde_json::Error>),

    /// Persistent storage could not be read or written. The SDK keeps working from memory.
    #[error("persistent storage is unavailable: {0}")]
    StorageUnavailable(String),

    /// SDK key is not a client SDK key.
    #[error("invalid SDK key, a client SDK key starting with \"client-\" is required")]
    InvalidSdkKey,

    /// Invalid base URL configuration.
    #[error("invalid api configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A unit of work panicked inside the error boundary.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Short stable name of the error kind. Used to deduplicate telemetry reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::NotLoaded => "NotLoaded",
            Error::MalformedPayload(_) => "MalformedPayload",
            Error::StorageUnavailable(_) => "StorageUnavailable",
            Error::InvalidSdkKey => "InvalidSdkKey",
            Error::InvalidBaseUrl(_) => "InvalidBaseUrl",
            Error::Unauthorized => "Unauthorized",
            Error::Network(_) => "Network",
            Error::Panicked(_) => "Panicked",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedPayload(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
