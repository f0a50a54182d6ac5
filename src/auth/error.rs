use crate::credentials::StoreError;
use crate::session::SessionError;

/// Authentication outcomes that reach the user
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("too many login attempts")]
    TooManyAttempts,

    /// Unknown email and wrong password are deliberately indistinguishable
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account is deactivated")]
    AccountInactive,

    #[error("csrf validation failed")]
    CsrfInvalid,

    #[error("session expired")]
    SessionExpired,

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// The string shown to the user. Backend detail stays in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::TooManyAttempts => "Too many login attempts. Please try again later.",
            AuthError::InvalidCredentials => "Invalid email or password.",
            AuthError::AccountInactive => {
                "Account is deactivated. Please contact administrator."
            }
            AuthError::CsrfInvalid => {
                "Security token expired. Please refresh the page and try again."
            }
            AuthError::SessionExpired => "Please login to access this page.",
            AuthError::Unavailable(_) => "System temporarily unavailable. Please try again.",
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        AuthError::Unavailable(e.to_string())
    }
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Expired => AuthError::SessionExpired,
            other => AuthError::Unavailable(other.to_string()),
        }
    }
}
