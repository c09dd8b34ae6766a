//! Hash functions used to derive cache keys from user identity and to look up pre-hashed names in
//! server payloads.
//!
//! None of the hashes here are security sensitive. Cache key hashes are a 32-bit rolling hash, so
//! collisions are possible. A collision only means two identities share a cache row until the
//! next successful fetch overwrites it.
use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::StatsigUser;

/// Upper bound on the number of memoized hash results per table. Tables are cleared when full.
const MEMO_CAPACITY: usize = 1000;

/// Two hash variants of the user identity.
///
/// `v1` covers user ID, stable ID, and custom IDs and is the key of the persisted cache row.
/// `v2` omits the stable ID and is used to find rows written before the stable ID was part of the
/// key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserCacheKey {
    /// Current key, including the stable ID.
    pub v1: String,
    /// Legacy key without the stable ID.
    pub v2: String,
}

/// Derive the cache key for `user` on the device identified by `stable_id`.
///
/// Parts are joined in order: `userID:<id>`, `stableID:<id>`, then each `type:value` custom ID
/// pair in the map's iteration order (sorted by type). Missing fields hash as empty strings.
pub fn get_user_cache_key(stable_id: &str, user: Option<&StatsigUser>) -> UserCacheKey {
    let user_id = user.and_then(|u| u.user_id.as_deref()).unwrap_or("");
    let mut parts = vec![format!("userID:{user_id}")];

    if let Some(user) = user {
        parts.extend(
            user.custom_ids
                .iter()
                .map(|(id_type, id)| format!("{id_type}:{id}")),
        );
    }

    let v2 = memoized_user_cache_key_hash(&parts.join(";"));

    parts.insert(1, format!("stableID:{stable_id}"));
    let v1 = memoized_user_cache_key_hash(&parts.join(";"));

    UserCacheKey { v1, v2 }
}

/// 32-bit rolling hash over UTF-16 code units (`hash * 31 + c` with wrapping).
pub fn fasthash(value: &str) -> i32 {
    value.encode_utf16().fold(0i32, |hash, c| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(c))
    })
}

/// [`fasthash`] rendered as an unsigned decimal string.
pub fn djb2_hash(value: &str) -> String {
    (fasthash(value) as u32).to_string()
}

/// Signed decimal [`fasthash`], memoized. Cache rows persisted by earlier sessions are keyed by
/// this representation, so it must not change.
pub fn memoized_user_cache_key_hash(value: &str) -> String {
    static TABLE: OnceLock<MemoTable> = OnceLock::new();
    TABLE
        .get_or_init(MemoTable::default)
        .get_or_insert_with(value, || fasthash(value).to_string())
}

/// Base64-encoded SHA-256 of `value`, memoized. Gate, config, and layer names arrive in server
/// payloads in this form.
pub fn sha256_hash(value: &str) -> String {
    static TABLE: OnceLock<MemoTable> = OnceLock::new();
    TABLE.get_or_init(MemoTable::default).get_or_insert_with(value, || {
        let digest = Sha256::digest(value.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(digest)
    })
}

/// Bounded memoization table for pure hash functions.
#[derive(Default)]
struct MemoTable {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoTable {
    fn get_or_insert_with(&self, key: &str, f: impl FnOnce() -> String) -> String {
        // A poisoned lock only means another thread panicked mid-insert. The table holds results
        // of a pure function, so computing without it is always correct.
        let Ok(mut entries) = self.entries.lock() else {
            return f();
        };

        if let Some(hit) = entries.get(key) {
            return hit.clone();
        }

        if entries.len() >= MEMO_CAPACITY {
            entries.clear();
        }

        let value = f();
        entries.insert(key.to_owned(), value.clone());
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fasthash_matches_reference_values() {
        assert_eq!(fasthash(""), 0);
        assert_eq!(fasthash("a"), 97);
        assert_eq!(fasthash("ab"), 97 * 31 + 98);
        // Overflows 32 bits and wraps to a negative value.
        assert_eq!(fasthash("userID:a-rather-long-user-identifier"), {
            "userID:a-rather-long-user-identifier"
                .encode_utf16()
                .fold(0i64, |h, c| ((h * 31 + i64::from(c)) as i32).into()) as i32
        });
    }

    #[test]
    fn djb2_is_unsigned() {
        let value = "userID:a-rather-long-user-identifier";
        assert_eq!(djb2_hash(value), (fasthash(value) as u32).to_string());
        assert!(!djb2_hash(value).starts_with('-'));
    }

    #[test]
    fn sha256_is_base64() {
        assert_eq!(
            sha256_hash("a_gate"),
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(b"a_gate"))
        );
        assert_eq!(
            sha256_hash(""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let user = StatsigUser::with_user_id("dloomb").with_custom_id("companyID", "acme");

        let first = get_user_cache_key("stable", Some(&user));
        let second = get_user_cache_key("stable", Some(&user));

        assert_eq!(first, second);
    }

    #[test]
    fn key_parts_are_ordered() {
        let user = StatsigUser::with_user_id("u")
            .with_custom_id("b", "2")
            .with_custom_id("a", "1");

        let key = get_user_cache_key("s", Some(&user));

        assert_eq!(key.v1, fasthash("userID:u;stableID:s;a:1;b:2").to_string());
        assert_eq!(key.v2, fasthash("userID:u;a:1;b:2").to_string());
    }

    #[test]
    fn v2_ignores_stable_id() {
        let user = StatsigUser::with_user_id("u");

        let a = get_user_cache_key("device-a", Some(&user));
        let b = get_user_cache_key("device-b", Some(&user));

        assert_ne!(a.v1, b.v1);
        assert_eq!(a.v2, b.v2);
    }

    #[test]
    fn missing_user_hashes_as_empty() {
        let key = get_user_cache_key("", None);

        assert_eq!(key.v2, fasthash("userID:").to_string());
        assert_eq!(key.v1, fasthash("userID:;stableID:").to_string());
    }
}
