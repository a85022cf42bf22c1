use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::encryption::TokenCipher;
use crate::errors::StorageError;
use crate::oauth::token::{chrono_duration, AuthorizationRecord, UserId};

/// Persistence for authorization records, one per user
///
/// Implementations own the encryption boundary: records come in and go out
/// with plaintext secrets, and only ciphertext is ever written.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create the user's record or replace it wholesale
    async fn upsert(&self, record: &AuthorizationRecord) -> Result<(), StorageError>;

    async fn find_by_user(&self, user_id: UserId)
        -> Result<Option<AuthorizationRecord>, StorageError>;

    /// Active, refreshable records whose token expires within `within` from now
    async fn find_expiring(&self, within: Duration)
        -> Result<Vec<AuthorizationRecord>, StorageError>;

    /// Overwrite tokens, key, nonce and expiry in place
    async fn update_tokens(&self, record: &AuthorizationRecord) -> Result<(), StorageError>;

    /// Stamp a call and remember the latest nonce. `None` leaves a field as is.
    async fn record_usage(
        &self,
        user_id: UserId,
        last_used_at: Option<DateTime<Utc>>,
        dpop_nonce: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Null every secret and clear the active flag. The row itself stays.
    async fn deactivate(&self, user_id: UserId) -> Result<(), StorageError>;
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS bluesky_auths (
        user_id INTEGER PRIMARY KEY NOT NULL,
        did TEXT NOT NULL,
        handle TEXT,
        encrypted_access_token TEXT,
        encrypted_refresh_token TEXT,
        encrypted_dpop_private_key TEXT,
        dpop_nonce TEXT,
        token_expires_at TEXT NOT NULL,
        last_used_at TEXT,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS bluesky_auths_token_expires_at ON bluesky_auths (token_expires_at)",
    "CREATE INDEX IF NOT EXISTS bluesky_auths_is_active ON bluesky_auths (is_active)",
];

#[derive(sqlx::FromRow)]
struct AuthRow {
    user_id: i64,
    did: String,
    handle: Option<String>,
    encrypted_access_token: Option<String>,
    encrypted_refresh_token: Option<String>,
    encrypted_dpop_private_key: Option<String>,
    dpop_nonce: Option<String>,
    token_expires_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    is_active: bool,
}

const SELECT_COLUMNS: &str = r#"
    SELECT user_id, did, handle,
           encrypted_access_token, encrypted_refresh_token, encrypted_dpop_private_key,
           dpop_nonce, token_expires_at, last_used_at, is_active
    FROM bluesky_auths
"#;

/// SQLite-backed credential store
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
    cipher: TokenCipher,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    /// Open (creating if needed) the database at `url`
    pub async fn connect(url: &str, cipher: TokenCipher) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool, cipher))
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn decrypt_row(&self, row: AuthRow) -> Result<AuthorizationRecord, StorageError> {
        Ok(AuthorizationRecord {
            user_id: row.user_id,
            did: row.did,
            handle: row.handle,
            access_token: self
                .cipher
                .open_opt(row.encrypted_access_token.as_deref())
                .await?,
            refresh_token: self
                .cipher
                .open_opt(row.encrypted_refresh_token.as_deref())
                .await?,
            dpop_private_key: self
                .cipher
                .open_opt(row.encrypted_dpop_private_key.as_deref())
                .await?,
            dpop_nonce: row.dpop_nonce,
            token_expires_at: row.token_expires_at,
            last_used_at: row.last_used_at,
            is_active: row.is_active,
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn upsert(&self, record: &AuthorizationRecord) -> Result<(), StorageError> {
        let access_token = self.cipher.seal_opt(record.access_token.as_deref()).await?;
        let refresh_token = self.cipher.seal_opt(record.refresh_token.as_deref()).await?;
        let private_key = self
            .cipher
            .seal_opt(record.dpop_private_key.as_deref())
            .await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO bluesky_auths (
                user_id, did, handle,
                encrypted_access_token, encrypted_refresh_token, encrypted_dpop_private_key,
                dpop_nonce, token_expires_at, last_used_at, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                did = excluded.did,
                handle = excluded.handle,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                encrypted_dpop_private_key = excluded.encrypted_dpop_private_key,
                dpop_nonce = excluded.dpop_nonce,
                token_expires_at = excluded.token_expires_at,
                last_used_at = excluded.last_used_at,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.user_id)
        .bind(&record.did)
        .bind(&record.handle)
        .bind(access_token)
        .bind(refresh_token)
        .bind(private_key)
        .bind(&record.dpop_nonce)
        .bind(record.token_expires_at)
        .bind(record.last_used_at)
        .bind(record.is_active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Stored authorization for user {}", record.user_id);
        Ok(())
    }

    async fn find_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<AuthorizationRecord>, StorageError> {
        let row = sqlx::query_as::<_, AuthRow>(&format!("{SELECT_COLUMNS} WHERE user_id = ?"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.decrypt_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_expiring(
        &self,
        within: Duration,
    ) -> Result<Vec<AuthorizationRecord>, StorageError> {
        let cutoff = Utc::now() + chrono_duration(within);

        let rows = sqlx::query_as::<_, AuthRow>(&format!(
            "{SELECT_COLUMNS}
            WHERE is_active = 1
              AND encrypted_refresh_token IS NOT NULL
              AND token_expires_at <= ?
            ORDER BY token_expires_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.decrypt_row(row).await?);
        }
        Ok(records)
    }

    async fn update_tokens(&self, record: &AuthorizationRecord) -> Result<(), StorageError> {
        let access_token = self.cipher.seal_opt(record.access_token.as_deref()).await?;
        let refresh_token = self.cipher.seal_opt(record.refresh_token.as_deref()).await?;
        let private_key = self
            .cipher
            .seal_opt(record.dpop_private_key.as_deref())
            .await?;

        sqlx::query(
            r#"
            UPDATE bluesky_auths SET
                encrypted_access_token = ?,
                encrypted_refresh_token = ?,
                encrypted_dpop_private_key = ?,
                dpop_nonce = ?,
                token_expires_at = ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(private_key)
        .bind(&record.dpop_nonce)
        .bind(record.token_expires_at)
        .bind(Utc::now())
        .bind(record.user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_usage(
        &self,
        user_id: UserId,
        last_used_at: Option<DateTime<Utc>>,
        dpop_nonce: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE bluesky_auths SET
                last_used_at = COALESCE(?, last_used_at),
                dpop_nonce = COALESCE(?, dpop_nonce),
                updated_at = ?
            WHERE user_id = ? AND is_active = 1
            "#,
        )
        .bind(last_used_at)
        .bind(dpop_nonce)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deactivate(&self, user_id: UserId) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE bluesky_auths SET
                encrypted_access_token = NULL,
                encrypted_refresh_token = NULL,
                encrypted_dpop_private_key = NULL,
                dpop_nonce = NULL,
                is_active = 0,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!("Deactivated authorization for user {}", user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use age::x25519::Identity;
    use sqlx::Row;

    use super::*;

    async fn store() -> SqliteCredentialStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteCredentialStore::new(pool, TokenCipher::new(Arc::new(Identity::generate())));
        store.migrate().await.unwrap();
        store
    }

    fn record(user_id: UserId, expires_in: chrono::Duration) -> AuthorizationRecord {
        AuthorizationRecord {
            user_id,
            did: format!("did:plc:user{user_id}"),
            handle: Some("alice.test".to_string()),
            access_token: Some("access-plaintext".to_string()),
            refresh_token: Some("refresh-plaintext".to_string()),
            dpop_private_key: Some("{\"kty\":\"EC\",\"d\":\"private-plaintext\"}".to_string()),
            dpop_nonce: None,
            token_expires_at: Utc::now() + expires_in,
            last_used_at: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_find_roundtrip() {
        let store = store().await;
        let original = record(7, chrono::Duration::hours(1));
        store.upsert(&original).await.unwrap();

        let found = store.find_by_user(7).await.unwrap().unwrap();
        assert_eq!(found.did, original.did);
        assert_eq!(found.access_token, original.access_token);
        assert_eq!(found.refresh_token, original.refresh_token);
        assert_eq!(found.dpop_private_key, original.dpop_private_key);
        assert_eq!(found.token_expires_at, original.token_expires_at);
        assert!(found.is_active);

        assert!(store.find_by_user(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_secrets_are_never_stored_in_plaintext() {
        let store = store().await;
        store
            .upsert(&record(7, chrono::Duration::hours(1)))
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT encrypted_access_token, encrypted_refresh_token, encrypted_dpop_private_key FROM bluesky_auths",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();

        for column in 0..3 {
            let value: String = row.get(column);
            assert!(!value.contains("plaintext"));
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_user() {
        let store = store().await;
        store
            .upsert(&record(7, chrono::Duration::hours(1)))
            .await
            .unwrap();

        let mut replacement = record(7, chrono::Duration::hours(2));
        replacement.did = "did:plc:replacement".to_string();
        store.upsert(&replacement).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bluesky_auths")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            store.find_by_user(7).await.unwrap().unwrap().did,
            "did:plc:replacement"
        );
    }

    #[tokio::test]
    async fn test_find_expiring_only_returns_active_records_in_window() {
        let store = store().await;
        store
            .upsert(&record(1, chrono::Duration::minutes(2)))
            .await
            .unwrap();
        store
            .upsert(&record(2, chrono::Duration::hours(2)))
            .await
            .unwrap();
        store
            .upsert(&record(3, chrono::Duration::minutes(-5)))
            .await
            .unwrap();
        store
            .upsert(&record(4, chrono::Duration::minutes(1)))
            .await
            .unwrap();
        store.deactivate(4).await.unwrap();

        let expiring = store
            .find_expiring(Duration::from_secs(300))
            .await
            .unwrap();
        let mut ids: Vec<_> = expiring.iter().map(|r| r.user_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_record_usage_keeps_fields_when_none_given() {
        let store = store().await;
        store
            .upsert(&record(7, chrono::Duration::hours(1)))
            .await
            .unwrap();

        let used_at = Utc::now();
        store
            .record_usage(7, Some(used_at), Some("nonce-1"))
            .await
            .unwrap();
        store.record_usage(7, None, None).await.unwrap();

        let found = store.find_by_user(7).await.unwrap().unwrap();
        assert_eq!(found.dpop_nonce.as_deref(), Some("nonce-1"));
        assert_eq!(found.last_used_at, Some(used_at));
    }

    #[tokio::test]
    async fn test_deactivate_nulls_secrets_but_keeps_row() {
        let store = store().await;
        store
            .upsert(&record(7, chrono::Duration::hours(1)))
            .await
            .unwrap();
        store.deactivate(7).await.unwrap();

        let found = store.find_by_user(7).await.unwrap().unwrap();
        assert!(!found.is_active);
        assert!(found.access_token.is_none());
        assert!(found.refresh_token.is_none());
        assert!(found.dpop_private_key.is_none());
        assert_eq!(found.did, "did:plc:user7");
    }
}
