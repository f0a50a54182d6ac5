use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::credentials::Role;
use crate::security::csrf::CsrfToken;

use super::SessionError;

/// Opaque session identifier carried in the cookie
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// 32 random bytes, base64url without padding
    pub fn generate() -> Self {
        let bytes = rand::random::<[u8; 32]>();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_cookie_value(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity snapshot held by a logged-in session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: i64,
    pub role: Role,
    pub email: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLevel {
    Success,
    Error,
    Info,
}

/// Full server-side session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user: Option<SessionUser>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub login_time: Option<DateTime<Utc>>,
    pub flash: HashMap<FlashLevel, String>,
    pub csrf: Option<CsrfToken>,
}

impl SessionRecord {
    pub fn new_anonymous() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            user: None,
            created_at: now,
            last_activity: now,
            login_time: None,
            flash: HashMap::new(),
            csrf: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }
}

/// Storage seam for session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, SessionError>;

    async fn save(&self, record: &SessionRecord) -> Result<(), SessionError>;

    async fn delete(&self, id: &SessionId) -> Result<(), SessionError>;

    /// Remove records idle past the timeout. Administrative helper; expiry
    /// itself is enforced lazily on access.
    async fn sweep_expired(&self, timeout: Duration) -> Result<u64, SessionError>;
}

/// In-memory session store for tests and database-less operation
pub struct MemorySessionStore {
    records: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn sweep_expired(&self, timeout: Duration) -> Result<u64, SessionError> {
        let cutoff = Utc::now() - timeout;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.last_activity >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

/// Postgres session store. Records are serialized to JSON and encrypted
/// with AES-256-GCM before they touch the database; the random nonce is
/// prepended to the ciphertext.
pub struct PgSessionStore {
    pool: PgPool,
    cipher: Aes256Gcm,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self { pool, cipher }
    }

    fn encrypt(&self, record: &SessionRecord) -> Result<Vec<u8>, SessionError> {
        let plaintext = serde_json::to_vec(record)
            .map_err(|e| SessionError::Store(format!("serialize session: {e}")))?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from(nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| SessionError::Store("session encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<SessionRecord, SessionError> {
        if blob.len() < 12 {
            return Err(SessionError::Store("session blob too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Store("session decryption failed".to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| SessionError::Store(format!("deserialize session: {e}")))
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, SessionError> {
        let row = sqlx::query("SELECT data FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        match row {
            Some(row) => {
                let blob: Vec<u8> = row
                    .try_get("data")
                    .map_err(|e| SessionError::Store(e.to_string()))?;
                Ok(Some(self.decrypt(&blob)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let blob = self.encrypt(record)?;
        // last_activity is duplicated in plaintext so sweeping stays server-side
        sqlx::query(
            "INSERT INTO sessions (id, data, last_activity) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET data = $2, last_activity = $3",
        )
        .bind(record.id.as_str())
        .bind(&blob)
        .bind(record.last_activity)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        Ok(())
    }

    async fn sweep_expired(&self, timeout: Duration) -> Result<u64, SessionError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE last_activity < now() - make_interval(secs => $1)",
        )
        .bind(timeout.num_seconds() as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Store(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
