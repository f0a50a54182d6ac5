pub mod postgres;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

pub use postgres::PgCredentialStore;
pub use users::{generate_password, hash_password, NewUser, Role, User};

/// Errors surfaced by credential storage
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("email already registered")]
    DuplicateEmail,

    #[error("password hashing failed: {0}")]
    Password(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
                StoreError::InvalidRow(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Storage seam for user identities and login-attempt counters
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up an active user by email (case-insensitive)
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Look up a user by email regardless of active status
    async fn find_by_email_any_status(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Look up an active user by id
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;

    /// Look up a user by id regardless of active status
    async fn find_by_id_any_status(&self, id: i64) -> Result<Option<User>, StoreError>;

    /// Create a user; the plaintext password is hashed before storage
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError>;

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError>;

    /// Stamp last_login for a successful authentication
    async fn update_last_login(&self, id: i64) -> Result<(), StoreError>;

    /// Record one failed credential check for (email, ip)
    async fn record_login_attempt(&self, email: &str, ip: &str) -> Result<(), StoreError>;

    /// Count failures for this email or ip within the trailing window
    async fn count_recent_attempts(
        &self,
        email: &str,
        ip: &str,
        window: Duration,
    ) -> Result<i64, StoreError>;

    /// Delete attempt rows matching the email, and the ip when given
    async fn clear_attempts(&self, email: &str, ip: Option<&str>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct AttemptRow {
    email: String,
    ip: String,
    attempted_at: DateTime<Utc>,
}

/// In-memory credential store. Backs the test suites and doubles as a
/// fallback when no database is configured.
pub struct MemoryCredentialStore {
    users: RwLock<HashMap<i64, User>>,
    attempts: RwLock<Vec<AttemptRow>>,
    next_id: AtomicI64,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            attempts: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Insert a user directly, bypassing hashing. Test helper.
    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    /// Backdate attempt rows so window-boundary cases can be exercised
    pub async fn backdate_attempts(&self, email: &str, by: Duration) {
        let mut attempts = self.attempts.write().await;
        for row in attempts.iter_mut().filter(|r| r.email == email) {
            row.attempted_at -= by;
        }
    }

    pub async fn attempt_count(&self) -> usize {
        self.attempts.read().await.len()
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .find_by_email_any_status(email)
            .await?
            .filter(|u| u.is_active))
    }

    async fn find_by_email_any_status(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self
            .find_by_id_any_status(id)
            .await?
            .filter(|u| u.is_active))
    }

    async fn find_by_id_any_status(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        if self.email_exists(&new_user.email).await? {
            return Err(StoreError::DuplicateEmail);
        }
        let password_hash = hash_password(&new_user.password)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let user = User {
            id,
            role: new_user.role,
            email: new_user.email,
            password_hash,
            full_name: new_user.full_name,
            phone: new_user.phone,
            is_active: true,
            password_change_required: false,
            created_at: Utc::now(),
            last_login: None,
        };
        self.users.write().await.insert(id, user.clone());
        Ok(user)
    }

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError> {
        Ok(self.find_by_email_any_status(email).await?.is_some())
    }

    async fn update_last_login(&self, id: i64) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(&id) {
            user.last_login = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_login_attempt(&self, email: &str, ip: &str) -> Result<(), StoreError> {
        self.attempts.write().await.push(AttemptRow {
            email: email.to_lowercase(),
            ip: ip.to_string(),
            attempted_at: Utc::now(),
        });
        Ok(())
    }

    async fn count_recent_attempts(
        &self,
        email: &str,
        ip: &str,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let cutoff = Utc::now() - window;
        let email = email.to_lowercase();
        let attempts = self.attempts.read().await;
        Ok(attempts
            .iter()
            .filter(|r| (r.email == email || r.ip == ip) && r.attempted_at > cutoff)
            .count() as i64)
    }

    async fn clear_attempts(&self, email: &str, ip: Option<&str>) -> Result<(), StoreError> {
        let email = email.to_lowercase();
        let mut attempts = self.attempts.write().await;
        attempts.retain(|r| r.email != email && ip.is_none_or(|ip| r.ip != ip));
        Ok(())
    }
}
