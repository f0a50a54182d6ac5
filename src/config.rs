/// Configuration for the medportal server
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    /// Failed attempts tolerated before a login is blocked
    pub max_login_attempts: u32,
    /// Trailing window (seconds) over which failed attempts are counted
    pub login_lockout_time: u64,
    /// Idle session lifetime in seconds
    pub session_timeout: u64,
    /// Session identifier rotation interval in seconds
    pub session_rotation_interval: u64,
    /// CSRF token lifetime in seconds
    pub csrf_token_ttl: u64,
    pub session_cookie_name: String,
    pub cookie_secure: bool,
    /// Key material for session encryption at rest
    pub session_key: String,
    /// Whether a successful login also clears attempt rows sharing the
    /// client IP (convenience for NAT'd offices sharing one address)
    pub clear_attempts_by_ip: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            database_url: None,
            max_login_attempts: 5,
            login_lockout_time: 900,
            session_timeout: 1800,
            session_rotation_interval: 1800,
            csrf_token_ttl: 3600,
            session_cookie_name: "MEDPORTAL_SESSION".to_string(),
            cookie_secure: false,
            session_key: String::new(),
            clear_attempts_by_ip: true,
        }
    }
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("MEDPORTAL_HOST").unwrap_or(defaults.host),
            port: std::env::var("MEDPORTAL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            database_url: std::env::var("DATABASE_URL").ok(),
            max_login_attempts: std::env::var("MAX_LOGIN_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_login_attempts),
            login_lockout_time: std::env::var("LOGIN_LOCKOUT_TIME")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.login_lockout_time),
            session_timeout: std::env::var("SESSION_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_timeout),
            session_rotation_interval: std::env::var("MEDPORTAL_SESSION_ROTATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_rotation_interval),
            csrf_token_ttl: std::env::var("MEDPORTAL_CSRF_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.csrf_token_ttl),
            session_cookie_name: std::env::var("MEDPORTAL_SESSION_COOKIE")
                .unwrap_or(defaults.session_cookie_name),
            cookie_secure: std::env::var("MEDPORTAL_COOKIE_SECURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cookie_secure),
            session_key: std::env::var("MEDPORTAL_SESSION_KEY").unwrap_or_default(),
            clear_attempts_by_ip: std::env::var("MEDPORTAL_CLEAR_ATTEMPTS_BY_IP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.clear_attempts_by_ip),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Session encryption key padded or truncated to 32 bytes
    pub fn session_key_bytes(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        let bytes = self.session_key.as_bytes();
        let len = bytes.len().min(32);
        key[..len].copy_from_slice(&bytes[..len]);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_login_attempts, 5);
        assert_eq!(config.login_lockout_time, 900);
        assert_eq!(config.session_timeout, 1800);
        assert_eq!(config.csrf_token_ttl, 3600);
        assert_eq!(config.session_cookie_name, "MEDPORTAL_SESSION");
        assert!(config.clear_attempts_by_ip);
    }

    #[test]
    fn test_session_key_padding() {
        let config = Config {
            session_key: "short".to_string(),
            ..Config::default()
        };
        let key = config.session_key_bytes();
        assert_eq!(&key[..5], b"short");
        assert_eq!(key[5..], [0u8; 27]);
    }

    #[test]
    fn test_server_addr() {
        let config = Config::default();
        assert_eq!(config.server_addr(), "0.0.0.0:4000");
    }
}
