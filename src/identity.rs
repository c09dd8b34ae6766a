//! Ownership of the current user and the device stable ID.
use serde::{Deserialize, Serialize};

use crate::{
    hashing::{get_user_cache_key, sha256_hash, UserCacheKey},
    Result, StatsigUser,
};

/// SDK name reported to the server.
pub(crate) const SDK_TYPE: &str = "rust-client";

/// Metadata sent along with every request and event batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsigMetadata {
    /// Always `rust-client`.
    pub sdk_type: String,
    /// Version of this crate.
    pub sdk_version: String,
    /// Stable ID of the device.
    #[serde(rename = "stableID")]
    pub stable_id: String,
}

pub(crate) struct Identity {
    user: StatsigUser,
    stable_id: String,
    /// Stable ID was supplied by the caller and must not be replaced by a persisted one.
    stable_id_overridden: bool,
}

impl Identity {
    /// Create identity for `user`. Without `override_stable_id`, a random stable ID is generated
    /// and later replaced by a persisted one, if any.
    pub fn new(user: StatsigUser, override_stable_id: Option<String>) -> Identity {
        let stable_id_overridden = override_stable_id.is_some();
        Identity {
            user,
            stable_id: override_stable_id.unwrap_or_else(generate_stable_id),
            stable_id_overridden,
        }
    }

    /// Adopt a stable ID read from storage.
    ///
    /// Returns the stable ID that should be written back to storage: the current one when nothing
    /// usable was persisted or when the caller overrode it, `None` when the persisted one was
    /// adopted.
    pub fn adopt_stable_id(&mut self, persisted: Result<Option<String>>) -> Option<String> {
        if !self.stable_id_overridden {
            match persisted {
                Ok(Some(stable_id)) if !stable_id.is_empty() => {
                    self.stable_id = stable_id;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!(target: "statsig", "failed to read stable ID, using a new one: {err}");
                }
            }
        }
        Some(self.stable_id.clone())
    }

    pub fn user(&self) -> &StatsigUser {
        &self.user
    }

    pub fn set_user(&mut self, user: StatsigUser) {
        self.user = user;
    }

    pub fn stable_id(&self) -> &str {
        &self.stable_id
    }

    pub fn cache_key(&self) -> UserCacheKey {
        self.cache_key_for(&self.user)
    }

    pub fn cache_key_for(&self, user: &StatsigUser) -> UserCacheKey {
        get_user_cache_key(&self.stable_id, Some(user))
    }

    pub fn metadata(&self) -> StatsigMetadata {
        StatsigMetadata {
            sdk_type: SDK_TYPE.to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
            stable_id: self.stable_id.clone(),
        }
    }
}

/// Hash of the full user object. A cached row is only used for `sinceTime` if it was fetched for
/// a user with the same hash.
pub(crate) fn user_hash(user: &StatsigUser) -> Result<String> {
    Ok(sha256_hash(&serde_json::to_string(user)?))
}

/// Random UUID v4 in its hyphenated form.
fn generate_stable_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn generated_stable_id_is_uuid_v4() {
        let id = generate_stable_id();

        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version(), Some(uuid::Version::Random));
        assert_eq!(id, parsed.hyphenated().to_string());
        assert_ne!(id, generate_stable_id());
    }

    #[test]
    fn user_hash_covers_all_attributes() {
        let user = StatsigUser::with_user_id("a");

        assert_eq!(user_hash(&user).unwrap(), user_hash(&user.clone()).unwrap());
        assert_ne!(
            user_hash(&user).unwrap(),
            user_hash(&user.clone().with_email("a@example.com")).unwrap()
        );
    }

    #[test]
    fn persisted_stable_id_is_adopted() {
        let mut identity = Identity::new(StatsigUser::default(), None);

        let write_back = identity.adopt_stable_id(Ok(Some("persisted".to_owned())));

        assert_eq!(identity.stable_id(), "persisted");
        assert_eq!(write_back, None);
    }

    #[test]
    fn override_wins_over_persisted() {
        let mut identity = Identity::new(StatsigUser::default(), Some("override".to_owned()));

        let write_back = identity.adopt_stable_id(Ok(Some("persisted".to_owned())));

        assert_eq!(identity.stable_id(), "override");
        assert_eq!(write_back.as_deref(), Some("override"));
    }

    #[test]
    fn missing_or_unreadable_stable_id_is_written_back() {
        let mut identity = Identity::new(StatsigUser::default(), None);
        let generated = identity.stable_id().to_owned();

        assert_eq!(identity.adopt_stable_id(Ok(None)), Some(generated.clone()));
        assert_eq!(
            identity.adopt_stable_id(Err(Error::StorageUnavailable("down".to_owned()))),
            Some(generated.clone())
        );
        assert_eq!(identity.adopt_stable_id(Ok(Some(String::new()))), Some(generated));
    }

    #[test]
    fn cache_key_includes_stable_id() {
        let first = Identity::new(StatsigUser::with_user_id("a"), Some("one".to_owned()));
        let second = Identity::new(StatsigUser::with_user_id("a"), Some("two".to_owned()));

        assert_ne!(first.cache_key(), second.cache_key());
        assert_eq!(
            first.cache_key_for(&StatsigUser::with_user_id("a")),
            first.cache_key()
        );
    }
}
