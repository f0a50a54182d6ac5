use chrono::Duration;

use crate::credentials::{CredentialStore, StoreError};

/// Threshold policy for repeated login failures.
///
/// Counting is shared across email and source address, so hammering many
/// accounts from one address locks the address, and hammering one account
/// from many addresses locks the account.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl LockoutPolicy {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::seconds(window_secs as i64),
        }
    }

    /// A count at or past the threshold blocks further attempts
    pub fn is_blocked(&self, recent_failures: i64) -> bool {
        recent_failures >= self.max_attempts as i64
    }

    /// Consult the store for the (email, ip) pair's standing
    pub async fn check(
        &self,
        store: &dyn CredentialStore,
        email: &str,
        ip: &str,
    ) -> Result<bool, StoreError> {
        let count = store.count_recent_attempts(email, ip, self.window).await?;
        Ok(self.is_blocked(count))
    }
}
