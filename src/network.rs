//! Fetching evaluations for a user and posting event batches.
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    exposure::{EventBatch, EventLogger},
    identity::StatsigMetadata,
    Clock, Error, Result, StatsigUser,
};

const INITIALIZE_ENDPOINT: &str = "initialize";
const LOG_EVENT_ENDPOINT: &str = "rgstr";

/// Request for server-computed evaluations of a single user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    /// Normalized user to evaluate for.
    pub user: StatsigUser,
    /// Server time of the last update cached for this exact user. Lets the server reply with
    /// `{"is_no_content": true}` when nothing changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_time: Option<i64>,
    /// Device metadata, including the stable ID.
    pub statsig_metadata: StatsigMetadata,
}

/// Source of initialize payloads.
///
/// The returned JSON is handed to the evaluation store as is. Implementations report a "no
/// changes" reply as `{"is_no_content": true}`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch evaluations for `request.user`.
    ///
    /// # Errors
    ///
    /// Transport and HTTP status failures. The store keeps its values in that case.
    async fn fetch_values(&self, request: &FetchRequest) -> Result<Value>;
}

/// [`Fetcher`] calling the initialize endpoint over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
    url: Url,
    sdk_key: String,
    clock: std::sync::Arc<dyn Clock + Send + Sync>,
}

impl HttpFetcher {
    pub(crate) fn new(
        api: &str,
        sdk_key: &str,
        clock: std::sync::Arc<dyn Clock + Send + Sync>,
    ) -> Result<HttpFetcher> {
        let url = Url::parse(api)
            .and_then(|api| api.join(INITIALIZE_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;
        Ok(HttpFetcher {
            client: reqwest::Client::new(),
            url,
            sdk_key: sdk_key.to_owned(),
            clock,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_values(&self, request: &FetchRequest) -> Result<Value> {
        log::debug!(target: "statsig", since_time:? = request.since_time; "fetching values");
        let body = json!({
            "user": request.user,
            "statsigMetadata": request.statsig_metadata,
            "sinceTime": request.since_time,
            "hash": "djb2",
        });

        let response = self
            .client
            .post(self.url.clone())
            .headers(headers(
                &self.sdk_key,
                &request.statsig_metadata,
                self.clock.now_millis(),
            ))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "statsig", "client is not authorized, check your SDK key");
                Err(Error::Unauthorized)
            }
            StatusCode::NO_CONTENT => Ok(json!({"is_no_content": true})),
            _ => {
                let values = response.error_for_status()?.json().await?;
                log::debug!(target: "statsig", "successfully fetched values");
                Ok(values)
            }
        }
    }
}

/// [`EventLogger`] posting batches to the event logging endpoint.
///
/// Each batch is sent on a task spawned on the current tokio runtime. Without a runtime, the batch
/// is dropped with a warning.
pub struct HttpEventLogger {
    client: reqwest::Client,
    url: Url,
    sdk_key: String,
    clock: std::sync::Arc<dyn Clock + Send + Sync>,
}

impl HttpEventLogger {
    pub(crate) fn new(
        event_logging_api: &str,
        sdk_key: &str,
        clock: std::sync::Arc<dyn Clock + Send + Sync>,
    ) -> Result<HttpEventLogger> {
        let url = Url::parse(event_logging_api)
            .and_then(|api| api.join(LOG_EVENT_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;
        Ok(HttpEventLogger {
            client: reqwest::Client::new(),
            url,
            sdk_key: sdk_key.to_owned(),
            clock,
        })
    }
}

impl EventLogger for HttpEventLogger {
    fn log_events(&self, batch: EventBatch) {
        let count = batch.events.len();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!(target: "statsig", count = count; "no async runtime, dropping events");
            return;
        };

        let request = self
            .client
            .post(self.url.clone())
            .headers(headers(
                &self.sdk_key,
                &batch.statsig_metadata,
                self.clock.now_millis(),
            ))
            .json(&batch);

        handle.spawn(async move {
            log::debug!(target: "statsig", count = count; "sending events");
            let result = match request.send().await {
                Ok(response) => response.error_for_status().map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                log::warn!(target: "statsig", "failed to send events: {err}");
            }
        });
    }
}

fn headers(sdk_key: &str, metadata: &StatsigMetadata, now: i64) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    let pairs = [
        ("STATSIG-API-KEY", sdk_key.to_owned()),
        ("STATSIG-CLIENT-TIME", now.to_string()),
        ("STATSIG-SDK-TYPE", metadata.sdk_type.clone()),
        ("STATSIG-SDK-VERSION", metadata.sdk_version.clone()),
    ];
    for (name, value) in pairs {
        match reqwest::header::HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => {
                log::warn!(target: "statsig", header = name; "dropping header with invalid value");
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> StatsigMetadata {
        StatsigMetadata {
            sdk_type: "rust-client".to_owned(),
            sdk_version: "0.1.0".to_owned(),
            stable_id: "stable".to_owned(),
        }
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = FetchRequest {
            user: StatsigUser::with_user_id("a"),
            since_time: Some(5),
            statsig_metadata: metadata(),
        };

        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["sinceTime"], 5);
        assert_eq!(json["user"]["userID"], "a");
        assert_eq!(json["statsigMetadata"]["stableID"], "stable");
    }

    #[test]
    fn joins_endpoint_to_api() {
        let clock = std::sync::Arc::new(|| 0i64);
        let fetcher = HttpFetcher::new("https://featuregates.org/v1/", "client-key", clock).unwrap();

        assert_eq!(fetcher.url.as_str(), "https://featuregates.org/v1/initialize");
    }

    #[test]
    fn invalid_api_is_rejected() {
        let result =
            HttpEventLogger::new("not a url", "client-key", std::sync::Arc::new(|| 0i64));

        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn headers_carry_key_and_time() {
        let headers = headers("client-key", &metadata(), 42);

        assert_eq!(headers["STATSIG-API-KEY"], "client-key");
        assert_eq!(headers["STATSIG-CLIENT-TIME"], "42");
        assert_eq!(headers["STATSIG-SDK-TYPE"], "rust-client");
    }
}
