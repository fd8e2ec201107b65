use crate::hash;
use crate::token::TokenRecord;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// How long a positive verification may be served from memory.
const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum TokenStoreError {
    #[error("token database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// SQLite-backed token store.
///
/// Lookup is a scan over non-revoked rows with a PBKDF2 recompute per
/// candidate; N is small (tens to hundreds), and a short-lived cache keyed
/// by a SHA-256 of the presented token absorbs per-request cost.
pub struct TokenStore {
    pool: SqlitePool,
    cache: DashMap<[u8; hash::DIGEST_LEN], (TokenRecord, Instant)>,
}

impl TokenStore {
    /// Open (creating if needed) the token database at `path`.
    pub async fn open(path: &Path) -> Result<Self, TokenStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            cache: DashMap::new(),
        };
        store.ensure_schema().await?;
        info!(path = %path.display(), "Token store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, TokenStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self {
            pool,
            cache: DashMap::new(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), TokenStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                token_salt TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked_at TEXT,
                allowed_scopes TEXT NOT NULL DEFAULT '*',
                allowed_environments TEXT NOT NULL DEFAULT '*',
                description TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Verify a presented bearer token. Returns the matching active record,
    /// or `None` for unknown, revoked, or expired tokens.
    pub async fn verify(&self, presented: &str) -> Result<Option<TokenRecord>, TokenStoreError> {
        let key = hash::cache_key(presented);
        if let Some(entry) = self.cache.get(&key) {
            let (record, cached_at) = entry.value();
            if cached_at.elapsed() < CACHE_TTL && record.is_active(Utc::now()) {
                return Ok(Some(record.clone()));
            }
        }
        self.cache.remove(&key);

        let candidates: Vec<TokenRecord> = sqlx::query_as::<_, TokenRecord>(
            "SELECT id, username, token_hash, token_salt, created_at, expires_at, revoked_at, \
             allowed_scopes, allowed_environments, description \
             FROM tokens WHERE revoked_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        for record in candidates {
            if !record.is_active(now) {
                continue;
            }
            let Some(salt) = hash::decode(&record.token_salt) else {
                continue;
            };
            let Some(stored) = hash::decode(&record.token_hash) else {
                continue;
            };
            let derived = hash::derive(presented, &salt);
            if hash::digests_match(&derived, &stored) {
                debug!(username = %record.username, "Token verified");
                self.cache.insert(key, (record.clone(), Instant::now()));
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Persist a new token grant; returns the row id. Exposed for the
    /// provisioning tool and tests.
    pub async fn insert(
        &self,
        username: &str,
        token: &str,
        allowed_scopes: &str,
        allowed_environments: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64, TokenStoreError> {
        let salt = hash::generate_salt();
        let digest = hash::derive(token, &salt);

        let result = sqlx::query(
            "INSERT INTO tokens \
             (username, token_hash, token_salt, created_at, expires_at, allowed_scopes, allowed_environments, description) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(hash::encode(&digest))
        .bind(hash::encode(&salt))
        .bind(Utc::now())
        .bind(expires_at)
        .bind(allowed_scopes)
        .bind(allowed_environments)
        .bind(description)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Mark a token revoked. Verification stops honouring it as soon as the
    /// cache entry lapses (at most 60 s).
    pub async fn revoke(&self, id: i64) -> Result<bool, TokenStoreError> {
        let result = sqlx::query("UPDATE tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every persisted grant, newest first. Used by the provisioning tool.
    pub async fn list(&self) -> Result<Vec<TokenRecord>, TokenStoreError> {
        let records = sqlx::query_as::<_, TokenRecord>(
            "SELECT id, username, token_hash, token_salt, created_at, expires_at, revoked_at, \
             allowed_scopes, allowed_environments, description \
             FROM tokens ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn active_count(&self) -> Result<i64, TokenStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tokens WHERE revoked_at IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_verify_roundtrip() {
        let store = TokenStore::in_memory().await.unwrap();
        store
            .insert("svc-orders", "s3cret-token", "Orders,Products", "6*", "orders service", None)
            .await
            .unwrap();

        let record = store.verify("s3cret-token").await.unwrap().expect("verified");
        assert_eq!(record.username, "svc-orders");
        assert_eq!(record.allowed_scopes, "Orders,Products");
        assert_eq!(record.allowed_environments, "6*");

        assert!(store.verify("wrong-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoked_token_fails_verification() {
        let store = TokenStore::in_memory().await.unwrap();
        let id = store
            .insert("svc", "tok", "*", "*", "", None)
            .await
            .unwrap();
        assert!(store.verify("tok").await.unwrap().is_some());

        assert!(store.revoke(id).await.unwrap());
        store.cache.clear(); // simulate cache lapse
        assert!(store.verify("tok").await.unwrap().is_none());
        // Second revoke is a no-op
        assert!(!store.revoke(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_token_fails_verification() {
        let store = TokenStore::in_memory().await.unwrap();
        store
            .insert("svc", "tok", "*", "*", "", Some(Utc::now() - ChronoDuration::hours(1)))
            .await
            .unwrap();
        assert!(store.verify("tok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verification_cache_hit() {
        let store = TokenStore::in_memory().await.unwrap();
        store.insert("svc", "tok", "*", "*", "", None).await.unwrap();

        assert!(store.verify("tok").await.unwrap().is_some());
        assert_eq!(store.cache.len(), 1);
        // Second verification is served from the cache.
        assert!(store.verify("tok").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tokens_are_stored_hashed() {
        let store = TokenStore::in_memory().await.unwrap();
        store.insert("svc", "plaintext-token", "*", "*", "", None).await.unwrap();

        let row = sqlx::query("SELECT token_hash, token_salt FROM tokens")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let stored_hash: String = row.get("token_hash");
        let stored_salt: String = row.get("token_salt");
        assert_ne!(stored_hash, "plaintext-token");
        assert!(!stored_hash.contains("plaintext"));
        assert_eq!(hash::decode(&stored_salt).unwrap().len(), hash::SALT_LEN);
        assert_eq!(hash::decode(&stored_hash).unwrap().len(), hash::DIGEST_LEN);
    }

    #[tokio::test]
    async fn test_active_count() {
        let store = TokenStore::in_memory().await.unwrap();
        store.insert("a", "t1", "*", "*", "", None).await.unwrap();
        let id = store.insert("b", "t2", "*", "*", "", None).await.unwrap();
        store.revoke(id).await.unwrap();
        assert_eq!(store.active_count().await.unwrap(), 1);
    }
}
