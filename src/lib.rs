//! Authentication, session, CSRF, and lockout core for a role-based
//! medical-office portal, with the HTTP surface needed to drive it.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod database;
pub mod security;
pub mod session;

pub use auth::{Access, AppState, AuthError, AuthService, ClientInfo, LockoutPolicy};
pub use config::Config;
pub use database::Database;
pub use credentials::{CredentialStore, MemoryCredentialStore, PgCredentialStore, Role, User};
pub use security::{Auditor, CsrfGuard};
pub use session::{SessionId, SessionManager};
