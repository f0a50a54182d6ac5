use async_trait::async_trait;
use chrono::Duration;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::users::{hash_password, NewUser, Role, User};
use super::{CredentialStore, StoreError};

/// Postgres-backed credential store
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Decode a users row column by column so schema drift fails loudly
fn decode_user(row: &PgRow) -> Result<User, StoreError> {
    let role_str: String = row.try_get("role")?;
    let role = Role::parse(&role_str)
        .ok_or_else(|| StoreError::InvalidRow(format!("unknown role '{}'", role_str)))?;

    Ok(User {
        id: row.try_get("id")?,
        role,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        full_name: row.try_get("full_name")?,
        phone: row.try_get("phone")?,
        is_active: row.try_get("is_active")?,
        password_change_required: row.try_get("password_change_required")?,
        created_at: row.try_get("created_at")?,
        last_login: row.try_get("last_login")?,
    })
}

const USER_COLUMNS: &str = "id, role, email, password_hash, full_name, phone, is_active, \
     password_change_required, created_at, last_login";

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1) AND is_active"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_user).transpose()
    }

    async fn find_by_email_any_status(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_user).transpose()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND is_active"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_user).transpose()
    }

    async fn find_by_id_any_status(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_user).transpose()
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        if self.email_exists(&new_user.email).await? {
            return Err(StoreError::DuplicateEmail);
        }
        let password_hash = hash_password(&new_user.password)?;

        let row = sqlx::query(&format!(
            "INSERT INTO users (role, email, password_hash, full_name, phone) \
             VALUES ($1, lower($2), $3, $4, $5) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(new_user.role.as_str())
        .bind(&new_user.email)
        .bind(&password_hash)
        .bind(&new_user.full_name)
        .bind(&new_user.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            // The unique index can still fire under a concurrent insert
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
            _ => StoreError::from(e),
        })?;

        decode_user(&row)
    }

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM users WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn update_last_login(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_login_attempt(&self, email: &str, ip: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO login_attempts (email, ip_address) VALUES (lower($1), $2)")
            .bind(email)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_recent_attempts(
        &self,
        email: &str,
        ip: &str,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT count(*) AS attempts FROM login_attempts \
             WHERE (email = lower($1) OR ip_address = $2) \
             AND attempted_at > now() - make_interval(secs => $3)",
        )
        .bind(email)
        .bind(ip)
        .bind(window.num_seconds() as f64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("attempts")?)
    }

    async fn clear_attempts(&self, email: &str, ip: Option<&str>) -> Result<(), StoreError> {
        match ip {
            Some(ip) => {
                sqlx::query(
                    "DELETE FROM login_attempts WHERE email = lower($1) OR ip_address = $2",
                )
                .bind(email)
                .bind(ip)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM login_attempts WHERE email = lower($1)")
                    .bind(email)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}
