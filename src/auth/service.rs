use std::sync::Arc;
use tracing::warn;

use crate::credentials::{CredentialStore, Role};
use crate::security::audit::{AuditAction, AuditEntry, Auditor};
use crate::session::{
    AuthenticatedSession, FlashLevel, SessionError, SessionId, SessionManager, SessionUser,
};

use super::error::AuthError;
use super::lockout::LockoutPolicy;

const MSG_LOGIN_REQUIRED: &str = "Please login to access this page.";
const MSG_ACCESS_DENIED: &str = "Access denied. Insufficient permissions.";

/// Outcome of a route guard. Denials carry a live session holding the
/// queued flash message, so the caller can set the cookie and redirect.
#[derive(Debug)]
pub enum Access {
    Granted(AuthenticatedSession),
    Denied {
        redirect_to: &'static str,
        session: SessionId,
    },
}

/// Request context threaded through every authentication decision
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

/// Orchestrates credential checks, lockout, session binding, and auditing
pub struct AuthService {
    users: Arc<dyn CredentialStore>,
    sessions: Arc<SessionManager>,
    auditor: Auditor,
    lockout: LockoutPolicy,
    clear_attempts_by_ip: bool,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn CredentialStore>,
        sessions: Arc<SessionManager>,
        auditor: Auditor,
        lockout: LockoutPolicy,
        clear_attempts_by_ip: bool,
    ) -> Self {
        Self {
            users,
            sessions,
            auditor,
            lockout,
            clear_attempts_by_ip,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Authenticate a credential pair against the store.
    ///
    /// Order matters: the lockout gate runs before any credential work, so
    /// a blocked caller learns nothing about the account, and a blocked
    /// attempt is never recorded as a failure. On success the session is
    /// re-keyed and the attempt counters for this caller are cleared.
    pub async fn login(
        &self,
        session: &SessionId,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<SessionId, AuthError> {
        let email = email.trim().to_lowercase();

        if self.lockout.check(self.users.as_ref(), &email, &client.ip).await? {
            self.audit(None, AuditAction::LoginAttemptBlocked, client).await;
            return Err(AuthError::TooManyAttempts);
        }

        let Some(user) = self.users.find_by_email_any_status(&email).await? else {
            self.users.record_login_attempt(&email, &client.ip).await?;
            self.audit(None, AuditAction::LoginFailedInvalidEmail, client).await;
            return Err(AuthError::InvalidCredentials);
        };

        if !user.verify_password(password) {
            self.users.record_login_attempt(&email, &client.ip).await?;
            self.audit(Some(user.id), AuditAction::LoginFailedWrongPassword, client)
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active {
            self.audit(Some(user.id), AuditAction::LoginFailedInactive, client)
                .await;
            return Err(AuthError::AccountInactive);
        }

        let new_session = self.sessions.login(session, &user).await?;

        // A stale last_login stamp is not worth failing the login over
        if let Err(e) = self.users.update_last_login(user.id).await {
            warn!(user_id = user.id, error = %e, "failed to stamp last_login");
        }

        let clear_ip = self.clear_attempts_by_ip.then_some(client.ip.as_str());
        self.users.clear_attempts(&email, clear_ip).await?;

        self.audit(Some(user.id), AuditAction::LoginSuccess, client).await;
        Ok(new_session)
    }

    /// Audit and destroy the session. Destroying an already-dead session
    /// is fine; only a genuine logout leaves a trail.
    pub async fn logout(&self, session: &SessionId, client: &ClientInfo) -> Result<(), AuthError> {
        if let Some(user) = self.sessions.peek_user(session).await? {
            self.audit(Some(user.user_id), AuditAction::Logout, client).await;
        }
        self.sessions.destroy(session).await?;
        Ok(())
    }

    /// Non-mutating view of the session's user
    pub async fn current_user(
        &self,
        session: &SessionId,
    ) -> Result<Option<SessionUser>, AuthError> {
        Ok(self.sessions.peek_user(session).await?)
    }

    /// Gate for pages that need a logged-in user. On denial a flash is
    /// queued on a live session and the caller is pointed at the login page.
    pub async fn require_auth(&self, session: Option<&SessionId>) -> Access {
        let Some(id) = session else {
            return self.deny("/login", None, MSG_LOGIN_REQUIRED).await;
        };
        match self.sessions.authenticate(id).await {
            Ok(auth) => Access::Granted(auth),
            Err(SessionError::Store(e)) => {
                warn!(error = %e, "session check failed, denying");
                self.deny("/login", None, MSG_LOGIN_REQUIRED).await
            }
            Err(_) => self.deny("/login", Some(id), MSG_LOGIN_REQUIRED).await,
        }
    }

    /// Gate for pages restricted to one role. The denial message never
    /// names the role that was required.
    pub async fn require_role(&self, session: Option<&SessionId>, role: Role) -> Access {
        self.require_any_role(session, &[role]).await
    }

    pub async fn require_any_role(&self, session: Option<&SessionId>, roles: &[Role]) -> Access {
        match self.require_auth(session).await {
            Access::Granted(auth) if roles.contains(&auth.user.role) => Access::Granted(auth),
            Access::Granted(auth) => {
                if let Err(e) = self
                    .sessions
                    .set_flash(&auth.id, FlashLevel::Error, MSG_ACCESS_DENIED)
                    .await
                {
                    warn!(error = %e, "failed to queue access-denied flash");
                }
                Access::Denied {
                    redirect_to: "/dashboard",
                    session: auth.id,
                }
            }
            denied => denied,
        }
    }

    async fn deny(
        &self,
        redirect_to: &'static str,
        stale: Option<&SessionId>,
        message: &str,
    ) -> Access {
        // Reuse a surviving anonymous session, else start fresh
        let record = match self.sessions.ensure(stale).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "could not start session for denial flash");
                return Access::Denied {
                    redirect_to,
                    session: SessionId::generate(),
                };
            }
        };
        if let Err(e) = self
            .sessions
            .set_flash(&record.id, FlashLevel::Error, message)
            .await
        {
            warn!(error = %e, "failed to queue denial flash");
        }
        Access::Denied {
            redirect_to,
            session: record.id,
        }
    }

    async fn audit(&self, user_id: Option<i64>, action: AuditAction, client: &ClientInfo) {
        self.auditor
            .record(AuditEntry::new(
                user_id,
                action,
                &client.ip,
                &client.user_agent,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{MemoryCredentialStore, NewUser};
    use crate::security::audit::MemoryAuditStore;
    use crate::session::MemorySessionStore;
    use chrono::Duration;

    struct Fixture {
        auth: AuthService,
        users: Arc<MemoryCredentialStore>,
        audit: Arc<MemoryAuditStore>,
        sessions: Arc<SessionManager>,
    }

    fn client() -> ClientInfo {
        ClientInfo {
            ip: "10.0.0.1".to_string(),
            user_agent: "test-agent".to_string(),
        }
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemoryCredentialStore::new());
        let audit = Arc::new(MemoryAuditStore::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Duration::seconds(1800),
            Duration::seconds(1800),
        ));
        let auth = AuthService::new(
            users.clone(),
            sessions.clone(),
            Auditor::new(audit.clone()),
            LockoutPolicy::new(5, 900),
            true,
        );
        Fixture {
            auth,
            users,
            audit,
            sessions,
        }
    }

    async fn seed(f: &Fixture, role: Role, email: &str, password: &str) -> i64 {
        f.users
            .create_user(NewUser {
                role,
                email: email.to_string(),
                password: password.to_string(),
                full_name: "Seed User".to_string(),
                phone: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_successful_login_binds_session() {
        let f = fixture();
        seed(&f, Role::Doctor, "doc@example.com", "pass-123").await;
        let anon = f.sessions.start().await.unwrap();

        let sid = f
            .auth
            .login(&anon.id, "doc@example.com", "pass-123", &client())
            .await
            .unwrap();
        assert_ne!(sid, anon.id);

        let user = f.auth.current_user(&sid).await.unwrap().unwrap();
        assert_eq!(user.role, Role::Doctor);
        assert_eq!(f.audit.actions().await, vec![AuditAction::LoginSuccess]);
    }

    #[tokio::test]
    async fn test_login_is_case_insensitive_on_email() {
        let f = fixture();
        seed(&f, Role::Patient, "pat@example.com", "pass-123").await;
        let anon = f.sessions.start().await.unwrap();

        f.auth
            .login(&anon.id, "  PAT@Example.COM ", "pass-123", &client())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_records_attempt_with_user_id() {
        let f = fixture();
        let uid = seed(&f, Role::Nurse, "n@example.com", "right-pass").await;
        let anon = f.sessions.start().await.unwrap();

        let err = f
            .auth
            .login(&anon.id, "n@example.com", "wrong-pass", &client())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(f.users.attempt_count().await, 1);

        let entries = f.audit.entries().await;
        assert_eq!(entries[0].action, AuditAction::LoginFailedWrongPassword);
        assert_eq!(entries[0].user_id, Some(uid));
    }

    #[tokio::test]
    async fn test_unknown_email_indistinguishable_from_wrong_password() {
        let f = fixture();
        let anon = f.sessions.start().await.unwrap();

        let err = f
            .auth
            .login(&anon.id, "ghost@example.com", "whatever", &client())
            .await
            .unwrap_err();
        assert_eq!(
            err.user_message(),
            AuthError::InvalidCredentials.user_message()
        );
        assert_eq!(
            f.audit.actions().await,
            vec![AuditAction::LoginFailedInvalidEmail]
        );
        assert_eq!(f.users.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn test_inactive_account_rejected_without_attempt_row() {
        let f = fixture();
        let uid = seed(&f, Role::Accountant, "off@example.com", "pass-123").await;
        let mut user = f.users.find_by_id(uid).await.unwrap().unwrap();
        user.is_active = false;
        f.users.insert_user(user).await;

        let anon = f.sessions.start().await.unwrap();
        let err = f
            .auth
            .login(&anon.id, "off@example.com", "pass-123", &client())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountInactive));
        assert_eq!(f.users.attempt_count().await, 0);
        assert_eq!(
            f.audit.actions().await,
            vec![AuditAction::LoginFailedInactive]
        );
    }

    #[tokio::test]
    async fn test_lockout_blocks_sixth_attempt_even_with_correct_password() {
        let f = fixture();
        seed(&f, Role::Nurse, "n@example.com", "right-pass").await;
        let anon = f.sessions.start().await.unwrap();

        for _ in 0..5 {
            let _ = f
                .auth
                .login(&anon.id, "n@example.com", "wrong-pass", &client())
                .await;
        }
        assert_eq!(f.users.attempt_count().await, 5);

        let err = f
            .auth
            .login(&anon.id, "n@example.com", "right-pass", &client())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TooManyAttempts));
        // The blocked attempt itself is not recorded
        assert_eq!(f.users.attempt_count().await, 5);
        assert_eq!(
            f.audit.actions().await.last(),
            Some(&AuditAction::LoginAttemptBlocked)
        );
    }

    #[tokio::test]
    async fn test_lockout_expires_with_window() {
        let f = fixture();
        seed(&f, Role::Nurse, "n@example.com", "right-pass").await;
        let anon = f.sessions.start().await.unwrap();

        for _ in 0..5 {
            let _ = f
                .auth
                .login(&anon.id, "n@example.com", "wrong-pass", &client())
                .await;
        }
        f.users
            .backdate_attempts("n@example.com", Duration::seconds(901))
            .await;

        f.auth
            .login(&anon.id, "n@example.com", "right-pass", &client())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_success_clears_attempts() {
        let f = fixture();
        seed(&f, Role::Patient, "p@example.com", "pass-123").await;
        let anon = f.sessions.start().await.unwrap();

        for _ in 0..3 {
            let _ = f
                .auth
                .login(&anon.id, "p@example.com", "bad", &client())
                .await;
        }
        assert_eq!(f.users.attempt_count().await, 3);

        f.auth
            .login(&anon.id, "p@example.com", "pass-123", &client())
            .await
            .unwrap();
        assert_eq!(f.users.attempt_count().await, 0);
    }

    #[tokio::test]
    async fn test_logout_audits_then_destroys() {
        let f = fixture();
        let uid = seed(&f, Role::Admin, "a@example.com", "pass-123").await;
        let anon = f.sessions.start().await.unwrap();
        let sid = f
            .auth
            .login(&anon.id, "a@example.com", "pass-123", &client())
            .await
            .unwrap();

        f.auth.logout(&sid, &client()).await.unwrap();
        assert!(f.auth.current_user(&sid).await.unwrap().is_none());

        let entries = f.audit.entries().await;
        let last = entries.last().unwrap();
        assert_eq!(last.action, AuditAction::Logout);
        assert_eq!(last.user_id, Some(uid));

        // Logging out a dead session is a no-op with no extra trail
        f.auth.logout(&sid, &client()).await.unwrap();
        assert_eq!(f.audit.entries().await.len(), entries.len());
    }

    #[tokio::test]
    async fn test_require_auth_denies_anonymous() {
        let f = fixture();
        let anon = f.sessions.start().await.unwrap();

        match f.auth.require_auth(Some(&anon.id)).await {
            Access::Denied {
                redirect_to,
                session,
            } => {
                assert_eq!(redirect_to, "/login");
                let flash = f.sessions.take_flash(&session).await.unwrap();
                assert_eq!(
                    flash.get(&FlashLevel::Error).map(String::as_str),
                    Some("Please login to access this page.")
                );
            }
            Access::Granted(_) => panic!("anonymous session must not pass"),
        }
    }

    #[tokio::test]
    async fn test_require_role_redirects_without_naming_role() {
        let f = fixture();
        seed(&f, Role::Patient, "p@example.com", "pass-123").await;
        let anon = f.sessions.start().await.unwrap();
        let sid = f
            .auth
            .login(&anon.id, "p@example.com", "pass-123", &client())
            .await
            .unwrap();

        match f.auth.require_role(Some(&sid), Role::Admin).await {
            Access::Denied {
                redirect_to,
                session,
            } => {
                assert_eq!(redirect_to, "/dashboard");
                let flash = f.sessions.take_flash(&session).await.unwrap();
                let message = flash.get(&FlashLevel::Error).unwrap();
                assert_eq!(message, "Access denied. Insufficient permissions.");
                assert!(!message.to_lowercase().contains("admin"));
                // Session survives a role denial
                assert!(f.auth.current_user(&session).await.unwrap().is_some());
            }
            Access::Granted(_) => panic!("patient must not reach admin pages"),
        }
    }

    #[tokio::test]
    async fn test_require_any_role_accepts_listed_roles() {
        let f = fixture();
        seed(&f, Role::Nurse, "n@example.com", "pass-123").await;
        let anon = f.sessions.start().await.unwrap();
        let sid = f
            .auth
            .login(&anon.id, "n@example.com", "pass-123", &client())
            .await
            .unwrap();

        let access = f
            .auth
            .require_any_role(Some(&sid), &[Role::Doctor, Role::Nurse])
            .await;
        assert!(matches!(access, Access::Granted(_)));
    }
}
