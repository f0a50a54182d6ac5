use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::session::{SessionError, SessionId, SessionManager};

/// Per-session CSRF token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

impl CsrfToken {
    /// 32 random bytes, base64url without padding
    pub fn generate() -> Self {
        let bytes = rand::random::<[u8; 32]>();
        Self {
            value: URL_SAFE_NO_PAD.encode(bytes),
            issued_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.issued_at
    }

    /// Constant-time equality against a submitted candidate
    pub fn matches(&self, candidate: &str) -> bool {
        let a = self.value.as_bytes();
        let b = candidate.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.ct_eq(b).into()
    }
}

/// CSRF protection bound to the session store.
///
/// One token per session; a token survives successful validation so a user
/// resubmitting the same form within the TTL is not rejected.
pub struct CsrfGuard {
    sessions: Arc<SessionManager>,
    ttl: Duration,
}

impl CsrfGuard {
    pub fn new(sessions: Arc<SessionManager>, ttl: Duration) -> Self {
        Self { sessions, ttl }
    }

    /// Mint a fresh token, replacing any existing one
    pub async fn issue(&self, session: &SessionId) -> Result<CsrfToken, SessionError> {
        let token = CsrfToken::generate();
        self.sessions.set_csrf_token(session, token.clone()).await?;
        Ok(token)
    }

    /// Return the session's live token, minting one if absent or expired
    pub async fn get_or_issue(&self, session: &SessionId) -> Result<CsrfToken, SessionError> {
        match self.sessions.csrf_token(session).await? {
            Some(token) if token.age() <= self.ttl => Ok(token),
            _ => self.issue(session).await,
        }
    }

    /// Check a submitted token. Absent, expired, or mismatched tokens all
    /// fail; an expired token is also cleared so the next render mints a
    /// fresh one.
    pub async fn validate(
        &self,
        session: &SessionId,
        candidate: &str,
    ) -> Result<bool, SessionError> {
        let Some(token) = self.sessions.csrf_token(session).await? else {
            return Ok(false);
        };

        if token.age() > self.ttl {
            debug!(session = %session, "csrf token expired");
            self.sessions.clear_csrf_token(session).await?;
            return Ok(false);
        }

        Ok(token.matches(candidate))
    }

    pub async fn clear(&self, session: &SessionId) -> Result<(), SessionError> {
        self.sessions.clear_csrf_token(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;

    fn setup() -> (Arc<SessionManager>, CsrfGuard) {
        let store = Arc::new(MemorySessionStore::new());
        let sessions = Arc::new(SessionManager::new(
            store,
            Duration::seconds(1800),
            Duration::seconds(1800),
        ));
        let guard = CsrfGuard::new(sessions.clone(), Duration::seconds(3600));
        (sessions, guard)
    }

    #[test]
    fn test_token_entropy_and_shape() {
        let token = CsrfToken::generate();
        assert_eq!(token.value.len(), 43);
        assert_ne!(token.value, CsrfToken::generate().value);
    }

    #[tokio::test]
    async fn test_validate_without_token_fails() {
        let (sessions, guard) = setup();
        let record = sessions.start().await.unwrap();
        assert!(!guard.validate(&record.id, "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_matching_token_validates_and_survives() {
        let (sessions, guard) = setup();
        let record = sessions.start().await.unwrap();
        let token = guard.get_or_issue(&record.id).await.unwrap();

        assert!(guard.validate(&record.id, &token.value).await.unwrap());
        // Resubmission of the same form within the TTL still passes
        assert!(guard.validate(&record.id, &token.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatched_token_fails() {
        let (sessions, guard) = setup();
        let record = sessions.start().await.unwrap();
        guard.issue(&record.id).await.unwrap();

        assert!(!guard.validate(&record.id, "forged-value").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let (sessions, guard) = setup();
        let record = sessions.start().await.unwrap();

        let fresh = CsrfToken {
            value: CsrfToken::generate().value,
            issued_at: Utc::now() - Duration::seconds(3599),
        };
        sessions
            .set_csrf_token(&record.id, fresh.clone())
            .await
            .unwrap();
        assert!(guard.validate(&record.id, &fresh.value).await.unwrap());

        let stale = CsrfToken {
            value: fresh.value.clone(),
            issued_at: Utc::now() - Duration::seconds(3601),
        };
        sessions.set_csrf_token(&record.id, stale).await.unwrap();
        assert!(!guard.validate(&record.id, &fresh.value).await.unwrap());
        // The expired token was cleared
        assert!(sessions.csrf_token(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_issue_reuses_live_token() {
        let (sessions, guard) = setup();
        let record = sessions.start().await.unwrap();

        let first = guard.get_or_issue(&record.id).await.unwrap();
        let second = guard.get_or_issue(&record.id).await.unwrap();
        assert_eq!(first.value, second.value);

        guard.clear(&record.id).await.unwrap();
        let third = guard.get_or_issue(&record.id).await.unwrap();
        assert_ne!(first.value, third.value);
    }
}
