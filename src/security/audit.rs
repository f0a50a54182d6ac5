use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Authentication outcomes that leave an audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LoginSuccess,
    LoginAttemptBlocked,
    LoginFailedInvalidEmail,
    LoginFailedWrongPassword,
    LoginFailedInactive,
    LoginRoleMismatch,
    Logout,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginSuccess => "login_success",
            AuditAction::LoginAttemptBlocked => "login_attempt_blocked",
            AuditAction::LoginFailedInvalidEmail => "login_failed_invalid_email",
            AuditAction::LoginFailedWrongPassword => "login_failed_wrong_password",
            AuditAction::LoginFailedInactive => "login_failed_inactive",
            AuditAction::LoginRoleMismatch => "login_role_mismatch",
            AuditAction::Logout => "logout",
        }
    }
}

/// One append-only audit row
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(user_id: Option<i64>, action: AuditAction, ip: &str, user_agent: &str) -> Self {
        Self {
            user_id,
            action,
            ip_address: ip.to_string(),
            user_agent: user_agent.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit sink
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), String>;
}

/// Records an audit entry and emits the matching structured log line.
///
/// The trail is best-effort: a failing sink is logged and never aborts the
/// authentication outcome it describes.
pub struct Auditor {
    store: std::sync::Arc<dyn AuditStore>,
}

impl Auditor {
    pub fn new(store: std::sync::Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: AuditEntry) {
        info!(
            action = entry.action.as_str(),
            user_id = entry.user_id,
            ip = %entry.ip_address,
            "audit event"
        );
        if let Err(e) = self.store.append(&entry).await {
            warn!(
                action = entry.action.as_str(),
                error = %e,
                "failed to persist audit entry"
            );
        }
    }
}

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO audit_logs (user_id, action, ip_address, user_agent, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// In-memory audit sink for tests
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn actions(&self) -> Vec<AuditAction> {
        self.entries.read().await.iter().map(|e| e.action).collect()
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), String> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }
}
