pub mod error;
pub mod lockout;
pub mod routes;
pub mod service;

pub use error::AuthError;
pub use lockout::LockoutPolicy;
pub use routes::{router, AppState};
pub use service::{Access, AuthService, ClientInfo};
