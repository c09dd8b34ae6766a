use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Maximum length (in characters) of a user ID, event name, or event value.
pub(crate) const MAX_VALUE_SIZE: usize = 64;
/// Maximum serialized size (in bytes) of a user object or event metadata.
pub(crate) const MAX_OBJ_SIZE: usize = 2048;

/// Environment the SDK is running in, e.g. `{"tier": "staging"}`.
pub type StatsigEnvironment = HashMap<String, String>;

/// The user evaluations are fetched for.
///
/// Custom IDs are kept in a sorted map, so cache key derivation over them is deterministic.
///
/// ```
/// # use statsig::StatsigUser;
/// let user = StatsigUser::with_user_id("a-user")
///     .with_custom_id("companyID", "statsig")
///     .with_email("user@example.com");
/// assert_eq!(user.user_id.as_deref(), Some("a-user"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsigUser {
    /// Primary user identifier.
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// User agent string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Two-letter country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Locale, e.g. `en_US`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Version of the host application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Custom attributes available to targeting rules.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
    /// Attributes used for evaluation but never logged with events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private_attributes: HashMap<String, serde_json::Value>,
    /// Additional identifiers by ID type.
    #[serde(rename = "customIDs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_ids: BTreeMap<String, String>,
    /// Set by the client from its configured environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statsig_environment: Option<StatsigEnvironment>,
}

impl StatsigUser {
    /// Create a user identified by `user_id`.
    pub fn with_user_id(user_id: impl Into<String>) -> StatsigUser {
        StatsigUser {
            user_id: Some(user_id.into()),
            ..StatsigUser::default()
        }
    }

    /// Add a custom ID of the given type (e.g., `companyID`).
    pub fn with_custom_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    /// Set user email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Add a custom attribute.
    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Return a copy of the user that fits the size limits accepted by the server, with
    /// `environment` attached.
    ///
    /// A user ID longer than 64 characters is truncated. If the serialized user is still larger
    /// than 2048 bytes, custom attributes are dropped, and if that is not enough, only the user ID
    /// is kept.
    pub(crate) fn normalized(&self, environment: Option<&StatsigEnvironment>) -> StatsigUser {
        let mut user = self.clone();

        if let Some(user_id) = &user.user_id {
            if user_id.chars().count() > MAX_VALUE_SIZE {
                log::info!(target: "statsig", "user ID is too large, trimming to {MAX_VALUE_SIZE} characters");
                user.user_id = Some(user_id.chars().take(MAX_VALUE_SIZE).collect());
            }
        }

        if serialized_len(&user) > MAX_OBJ_SIZE {
            user.custom.clear();
            if serialized_len(&user) > MAX_OBJ_SIZE {
                log::info!(target: "statsig", "user object is too large, only keeping the user ID");
                user = StatsigUser {
                    user_id: user.user_id,
                    ..StatsigUser::default()
                };
            } else {
                log::info!(target: "statsig", "user object is too large, dropping the custom property");
            }
        }

        if let Some(environment) = environment {
            user.statsig_environment = Some(environment.clone());
        }

        user
    }
}

fn serialized_len<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value).map_or(0, |s| s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_server_field_names() {
        let user = StatsigUser::with_user_id("123").with_custom_id("workID", "w-1");

        let json = serde_json::to_value(&user).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"userID": "123", "customIDs": {"workID": "w-1"}})
        );
    }

    #[test]
    fn trims_long_user_id() {
        let user = StatsigUser::with_user_id("x".repeat(100));

        let normalized = user.normalized(None);

        assert_eq!(normalized.user_id.unwrap().len(), MAX_VALUE_SIZE);
    }

    #[test]
    fn drops_custom_when_too_large() {
        let user = StatsigUser::with_user_id("a").with_custom("blob", "y".repeat(3000));

        let normalized = user.normalized(None);

        assert!(normalized.custom.is_empty());
        assert_eq!(normalized.user_id.as_deref(), Some("a"));
    }

    #[test]
    fn keeps_only_user_id_when_still_too_large() {
        let mut user = StatsigUser::with_user_id("a").with_email("e".repeat(3000));
        user.country = Some("US".to_owned());

        let normalized = user.normalized(None);

        assert_eq!(normalized, StatsigUser::with_user_id("a"));
    }

    #[test]
    fn attaches_environment() {
        let environment = StatsigEnvironment::from([("tier".to_owned(), "staging".to_owned())]);

        let normalized = StatsigUser::default().normalized(Some(&environment));

        assert_eq!(normalized.statsig_environment, Some(environment));
    }
}
