use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Roles recognised by the portal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Nurse,
    Pharmacy,
    Accountant,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Pharmacy => "pharmacy",
            Role::Accountant => "accountant",
            Role::Patient => "patient",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "admin" => Some(Role::Admin),
            "doctor" => Some(Role::Doctor),
            "nurse" => Some(Role::Nurse),
            "pharmacy" => Some(Role::Pharmacy),
            "accountant" => Some(Role::Accountant),
            "patient" => Some(Role::Patient),
            _ => None,
        }
    }

    /// Landing page a user of this role is sent to after login
    pub fn landing_path(&self) -> &'static str {
        match self {
            Role::Admin => "/admin",
            Role::Doctor => "/staff/doctor",
            Role::Nurse => "/staff/nurse",
            Role::Pharmacy => "/staff/pharmacy",
            Role::Accountant => "/staff/accountant",
            Role::Patient => "/patient",
        }
    }

    /// Staff roles share the staff login surface
    pub fn is_staff(&self) -> bool {
        matches!(
            self,
            Role::Doctor | Role::Nurse | Role::Pharmacy | Role::Accountant
        )
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User identity record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub role: Role,
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub password_change_required: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    /// Verify a plaintext password against the stored hash.
    ///
    /// A malformed stored hash counts as a mismatch rather than an error;
    /// the login path treats both identically.
    pub fn verify_password(&self, plaintext: &str) -> bool {
        verify_password(&self.password_hash, plaintext)
    }
}

/// Input for creating a user (registration or admin provisioning)
#[derive(Debug, Clone)]
pub struct NewUser {
    pub role: Role,
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub phone: Option<String>,
}

/// Hash a plaintext password with argon2 and a random salt
pub fn hash_password(plaintext: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::Password(e.to_string()))
}

/// Verify a plaintext password against a stored argon2 hash
pub fn verify_password(hash: &str, plaintext: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Generate a random password for admin-provisioned accounts
pub fn generate_password(length: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()";
    (0..length)
        .map(|_| CHARS[rand::random_range(0..CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [
            Role::Admin,
            Role::Doctor,
            Role::Nurse,
            Role::Pharmacy,
            Role::Accountant,
            Role::Patient,
        ] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("janitor"), None);
    }

    #[test]
    fn test_landing_paths() {
        assert_eq!(Role::Admin.landing_path(), "/admin");
        assert_eq!(Role::Nurse.landing_path(), "/staff/nurse");
        assert_eq!(Role::Patient.landing_path(), "/patient");
    }

    #[test]
    fn test_staff_roles() {
        assert!(Role::Doctor.is_staff());
        assert!(Role::Accountant.is_staff());
        assert!(!Role::Admin.is_staff());
        assert!(!Role::Patient.is_staff());
    }

    #[test]
    fn test_password_hash_and_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password(&hash, "correct horse"));
        assert!(!verify_password(&hash, "wrong horse"));
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(!verify_password("not-a-phc-string", "anything"));
    }

    #[test]
    fn test_generate_password_length_and_charset() {
        let password = generate_password(12);
        assert_eq!(password.len(), 12);
        // Two draws colliding is astronomically unlikely
        assert_ne!(generate_password(32), generate_password(32));
    }
}
