//! Pending authorizations between `initialize_auth` and the callback
//!
//! These live in a [`ContextStore`]: a key-value store with a TTL and an
//! atomic take, so a `state` can be redeemed at most once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::StorageError;
use crate::oauth::token::UserId;

/// Prefix of every pending-authorization key
pub const PENDING_KEY_PREFIX: &str = "bluesky_auth_";

/// Represents the data held for a user between authorize redirect and callback
#[derive(Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// The local user starting the flow
    pub user_id: UserId,
    /// PKCE code verifier - the original random string
    pub code_verifier: String,
    /// PKCE code challenge sent in the authorize URL
    pub code_challenge: String,
    /// Private JWK of the key pair this grant will be bound to
    pub dpop_private_key: String,
    /// Optional handle hint passed as `login_hint`
    pub handle: Option<String>,
    /// The `state` token this entry is keyed by
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn storage_key(state: &str) -> String {
        format!("{PENDING_KEY_PREFIX}{state}")
    }
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("user_id", &self.user_id)
            .field("handle", &self.handle)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Short-lived key-value storage with TTL and consume-once reads
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Store `value` under `key`, replacing anything there, for at most `ttl`
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError>;

    /// Atomically return and remove the value under `key`
    ///
    /// Returns `None` when the key is absent or its TTL has elapsed. Two
    /// concurrent takes of the same key never both see the value.
    async fn take(&self, key: &str) -> Result<Option<String>, StorageError>;
}

/// Save a pending authorization under its state token
pub async fn store_pending(
    store: &dyn ContextStore,
    pending: &PendingAuthorization,
    ttl: Duration,
) -> Result<(), StorageError> {
    let value = serde_json::to_string(pending)?;
    store
        .put(&PendingAuthorization::storage_key(&pending.state), value, ttl)
        .await
}

/// Consume the pending authorization for `state`, if there is one
pub async fn take_pending(
    store: &dyn ContextStore,
    state: &str,
) -> Result<Option<PendingAuthorization>, StorageError> {
    match store.take(&PendingAuthorization::storage_key(state)).await? {
        Some(value) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

/// In-process context store, for tests and single-instance deployments
///
/// Expiry uses `tokio::time::Instant` so tests can drive it with a paused clock.
#[derive(Default)]
pub struct MemoryContextStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        // A panic while holding this lock cannot leave the map half-updated
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StorageError> {
        let removed = self.lock().remove(key);
        Ok(removed
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value))
    }
}

/// Redis-backed context store shared between instances
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisContextStore {
    connection: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisContextStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl ContextStore for RedisContextStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut connection = self.connection.clone();
        // GETDEL is a single command, so the read and delete cannot interleave
        let value = redis::cmd("GETDEL")
            .arg(key)
            .query_async::<_, Option<String>>(&mut connection)
            .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pending(state: &str) -> PendingAuthorization {
        let now = Utc::now();
        PendingAuthorization {
            user_id: 7,
            code_verifier: "verifier-material".to_string(),
            code_challenge: "challenge".to_string(),
            dpop_private_key: "private-key-material".to_string(),
            handle: Some("alice.test".to_string()),
            state: state.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_take_consumes_the_entry() {
        let store = MemoryContextStore::new();
        store_pending(&store, &pending("abc"), Duration::from_secs(60))
            .await
            .unwrap();

        let first = take_pending(&store, "abc").await.unwrap();
        assert_eq!(first.unwrap().user_id, 7);

        let second = take_pending(&store, "abc").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = MemoryContextStore::new();
        store
            .put("k", "v".to_string(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(store.is_empty());
        assert_eq!(store.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_takes_only_one_wins() {
        let store = Arc::new(MemoryContextStore::new());
        store
            .put("race", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("race").await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_storage_key_prefix() {
        assert_eq!(PendingAuthorization::storage_key("xyz"), "bluesky_auth_xyz");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let output = format!("{:?}", pending("abc"));
        assert!(!output.contains("verifier-material"));
        assert!(!output.contains("private-key-material"));
        assert!(output.contains("alice.test"));
    }
}
