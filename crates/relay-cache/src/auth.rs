//! Authentication cache.
//!
//! Maps API keys to user records with a short positive TTL and a shorter
//! negative TTL. Negative caching bounds datastore load from key-probing
//! traffic; the short negative TTL keeps a freshly rotated key from being
//! locked out for long. Cache keys are SHA-256 hashes of the API key, so
//! raw keys never land in the cache backend.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use relay_core::{mask_key, StoreError, User, UserStore};

use crate::store::{CacheEntry, CacheStore};

const USER_PREFIX: &str = "auth:key_user:";
const USER_ID_PREFIX: &str = "auth:user_id:";

/// API key to user lookup cache
pub struct AuthCache {
    cache: Arc<CacheStore>,
    store: Arc<dyn UserStore>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl AuthCache {
    /// Create an auth cache over the given store and datastore
    #[must_use]
    pub fn new(
        cache: Arc<CacheStore>,
        store: Arc<dyn UserStore>,
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            positive_ttl,
            negative_ttl,
        }
    }

    fn key_hash(api_key: &str) -> String {
        let digest = Sha256::digest(api_key.as_bytes());
        hex::encode(digest)[..32].to_string()
    }

    fn user_cache_key(api_key: &str) -> String {
        format!("{USER_PREFIX}{}", Self::key_hash(api_key))
    }

    fn user_id_cache_key(user_id: i64) -> String {
        format!("{USER_ID_PREFIX}{user_id}")
    }

    /// Look up a user by API key.
    ///
    /// `Ok(None)` means the key is unknown (cached negative or datastore
    /// miss); callers treat it as 401, never as anonymous.
    ///
    /// # Errors
    /// Propagates datastore unavailability so it surfaces as a 5xx rather
    /// than a spurious 401.
    pub async fn lookup(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        let cache_key = Self::user_cache_key(api_key);

        match self.cache.get_entry::<User>(&cache_key).await {
            CacheEntry::Hit(user) => {
                debug!(key = %mask_key(api_key), "Auth cache hit");
                return Ok(Some(user));
            }
            CacheEntry::Miss => {
                debug!(key = %mask_key(api_key), "Auth cache negative hit");
                return Ok(None);
            }
            CacheEntry::Unknown => {}
        }

        match self.store.get_user_by_key(api_key).await? {
            Some(user) => {
                self.cache
                    .set_hit(&cache_key, &user, self.positive_ttl)
                    .await;
                // Reverse index so invalidate_user can find the key entry
                self.cache
                    .set_hit(
                        &Self::user_id_cache_key(user.id),
                        &cache_key,
                        self.positive_ttl,
                    )
                    .await;
                debug!(key = %mask_key(api_key), user_id = user.id, "Auth cache fill");
                Ok(Some(user))
            }
            None => {
                self.cache.set_miss(&cache_key, self.negative_ttl).await;
                debug!(key = %mask_key(api_key), "Auth cache negative fill");
                Ok(None)
            }
        }
    }

    /// Invalidate the cached record for an API key.
    ///
    /// Must be called on every mutation of the underlying user record:
    /// credit deduction, plan change, key revocation.
    pub async fn invalidate(&self, api_key: &str) {
        self.cache.delete(&Self::user_cache_key(api_key)).await;
    }

    /// Invalidate all cached records for a user id.
    pub async fn invalidate_user(&self, user_id: i64) {
        let index_key = Self::user_id_cache_key(user_id);
        if let CacheEntry::Hit(user_key) = self.cache.get_entry::<String>(&index_key).await {
            self.cache.delete(&user_key).await;
        }
        self.cache.delete(&index_key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::store::MemoryUserStore;
    use relay_core::{EnvironmentTag, TrialDescriptor};

    fn user(key: &str) -> User {
        User {
            id: 42,
            api_key: key.to_string(),
            environment_tag: EnvironmentTag::Live,
            credits: 10.0,
            plan_id: None,
            trial: TrialDescriptor::default(),
        }
    }

    fn auth_cache(store: Arc<MemoryUserStore>) -> AuthCache {
        AuthCache::new(
            Arc::new(CacheStore::in_memory()),
            store,
            Duration::from_secs(300),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn lookup_caches_positive() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k_good"));
        let cache = auth_cache(Arc::clone(&store));

        let found = cache.lookup("k_good").await.expect("lookup");
        assert_eq!(found.map(|u| u.id), Some(42));

        // Second lookup served from cache even after the store forgets
        let found = cache.lookup("k_good").await.expect("lookup");
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn unknown_key_is_negative_cached() {
        let store = Arc::new(MemoryUserStore::new());
        let cache = auth_cache(Arc::clone(&store));

        assert!(cache.lookup("k_bad").await.expect("lookup").is_none());

        // Key appears in the store, but the negative entry still answers
        store.put_user(user("k_bad"));
        assert!(cache.lookup("k_bad").await.expect("lookup").is_none());

        // Until invalidated
        cache.invalidate("k_bad").await;
        assert!(cache.lookup("k_bad").await.expect("lookup").is_some());
    }

    #[tokio::test]
    async fn invalidate_user_clears_key_entry() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k_good"));
        let cache = auth_cache(Arc::clone(&store));

        cache.lookup("k_good").await.expect("lookup");
        cache.invalidate_user(42).await;

        // Next lookup must go back to the datastore; mutate it to observe
        store.put_user(User {
            credits: 99.0,
            ..user("k_good")
        });
        let found = cache.lookup("k_good").await.expect("lookup").expect("user");
        assert!((found.credits - 99.0).abs() < f64::EPSILON);
    }
}
