pub mod audit;
pub mod csrf;
pub mod request;

pub use audit::{AuditAction, AuditEntry, AuditStore, Auditor, MemoryAuditStore, PgAuditStore};
pub use csrf::{CsrfGuard, CsrfToken};
