pub mod store;

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::credentials::User;
use crate::security::csrf::CsrfToken;

pub use store::{
    FlashLevel, MemorySessionStore, PgSessionStore, SessionId, SessionRecord, SessionStore,
    SessionUser,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session expired")]
    Expired,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session store error: {0}")]
    Store(String),
}

/// A session that passed the logged-in check. Carries the possibly rotated
/// identifier so the caller can re-set the cookie.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub id: SessionId,
    pub user: SessionUser,
    pub rotated: bool,
}

/// Server-side session lifecycle over an injected store.
///
/// Identifiers rotate on privilege change (login) and again once the record
/// is older than the rotation interval. Expiry is enforced lazily: an idle
/// record past the timeout is destroyed on the access that notices it.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    timeout: Duration,
    rotation_interval: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, timeout: Duration, rotation_interval: Duration) -> Self {
        Self {
            store,
            timeout,
            rotation_interval,
        }
    }

    /// Create and persist a fresh anonymous session
    pub async fn start(&self) -> Result<SessionRecord, SessionError> {
        let record = SessionRecord::new_anonymous();
        self.store.save(&record).await?;
        Ok(record)
    }

    /// Load the caller's session, or start a new anonymous one when the
    /// identifier is absent, unknown, or idle past the timeout
    pub async fn ensure(&self, id: Option<&SessionId>) -> Result<SessionRecord, SessionError> {
        if let Some(id) = id {
            match self.store.load(id).await? {
                Some(record) if !self.is_expired(&record) => {
                    let mut record = record;
                    record.last_activity = Utc::now();
                    self.store.save(&record).await?;
                    return Ok(record);
                }
                Some(expired) => {
                    debug!(session = %expired.id, "destroying expired session");
                    self.store.delete(&expired.id).await?;
                }
                None => {}
            }
        }
        self.start().await
    }

    /// Bind a user to the session. The identifier is regenerated so the
    /// pre-login id never names a logged-in record; flash and CSRF state
    /// carry over.
    pub async fn login(&self, id: &SessionId, user: &User) -> Result<SessionId, SessionError> {
        let previous = self.store.load(id).await?;
        if previous.is_some() {
            self.store.delete(id).await?;
        }

        let now = Utc::now();
        let mut record = SessionRecord::new_anonymous();
        if let Some(previous) = previous {
            record.flash = previous.flash;
            record.csrf = previous.csrf;
        }
        record.user = Some(SessionUser {
            user_id: user.id,
            role: user.role,
            email: user.email.clone(),
            full_name: user.full_name.clone(),
        });
        record.created_at = now;
        record.last_activity = now;
        record.login_time = Some(now);

        self.store.save(&record).await?;
        Ok(record.id)
    }

    /// The authoritative logged-in check.
    ///
    /// An idle record past the timeout is destroyed and reported as
    /// `Expired`. Otherwise activity is refreshed, and a record older than
    /// the rotation interval gets a new identifier with state preserved.
    pub async fn authenticate(&self, id: &SessionId) -> Result<AuthenticatedSession, SessionError> {
        let Some(mut record) = self.store.load(id).await? else {
            return Err(SessionError::NotAuthenticated);
        };

        if self.is_expired(&record) {
            self.store.delete(&record.id).await?;
            return Err(SessionError::Expired);
        }

        let Some(user) = record.user.clone() else {
            return Err(SessionError::NotAuthenticated);
        };

        let now = Utc::now();
        record.last_activity = now;

        let rotated = now - record.created_at > self.rotation_interval;
        if rotated {
            // Old id dies immediately; a request racing the rotation may
            // observe a logged-out session
            self.store.delete(&record.id).await?;
            record.id = SessionId::generate();
            record.created_at = now;
        }

        self.store.save(&record).await?;
        Ok(AuthenticatedSession {
            id: record.id,
            user,
            rotated,
        })
    }

    /// Read the session's user without refreshing activity or rotating.
    /// Expired records read as absent.
    pub async fn peek_user(&self, id: &SessionId) -> Result<Option<SessionUser>, SessionError> {
        Ok(self
            .store
            .load(id)
            .await?
            .filter(|r| !self.is_expired(r))
            .and_then(|r| r.user))
    }

    pub async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        self.store.delete(id).await
    }

    /// Queue a read-once flash message
    pub async fn set_flash(
        &self,
        id: &SessionId,
        level: FlashLevel,
        message: &str,
    ) -> Result<(), SessionError> {
        self.with_record(id, |record| {
            record.flash.insert(level, message.to_string());
        })
        .await
    }

    /// Take all queued flash messages, clearing them
    pub async fn take_flash(
        &self,
        id: &SessionId,
    ) -> Result<HashMap<FlashLevel, String>, SessionError> {
        let mut taken = HashMap::new();
        self.with_record(id, |record| {
            taken = std::mem::take(&mut record.flash);
        })
        .await?;
        Ok(taken)
    }

    pub async fn has_flash(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self
            .store
            .load(id)
            .await?
            .map(|r| !r.flash.is_empty())
            .unwrap_or(false))
    }

    pub async fn csrf_token(&self, id: &SessionId) -> Result<Option<CsrfToken>, SessionError> {
        Ok(self.store.load(id).await?.and_then(|r| r.csrf))
    }

    pub async fn set_csrf_token(
        &self,
        id: &SessionId,
        token: CsrfToken,
    ) -> Result<(), SessionError> {
        self.with_record(id, |record| {
            record.csrf = Some(token);
        })
        .await
    }

    pub async fn clear_csrf_token(&self, id: &SessionId) -> Result<(), SessionError> {
        self.with_record(id, |record| {
            record.csrf = None;
        })
        .await
    }

    /// Drop records idle past the timeout
    pub async fn sweep_expired(&self) -> Result<u64, SessionError> {
        self.store.sweep_expired(self.timeout).await
    }

    fn is_expired(&self, record: &SessionRecord) -> bool {
        Utc::now() - record.last_activity > self.timeout
    }

    async fn with_record<F>(&self, id: &SessionId, mutate: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let Some(mut record) = self.store.load(id).await? else {
            return Err(SessionError::NotAuthenticated);
        };
        mutate(&mut record);
        self.store.save(&record).await
    }
}
