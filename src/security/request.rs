use axum::http::HeaderMap;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
});

const MAX_USER_AGENT_LEN: usize = 512;

/// Proxy headers consulted for the client address, most trusted first
const IP_HEADERS: [&str; 4] = ["cf-connecting-ip", "x-forwarded-for", "x-real-ip", "client-ip"];

/// Resolve the client IP from proxy headers, falling back to the socket
/// address. Values that do not parse as an IP literal are skipped.
pub fn client_ip(headers: &HeaderMap, socket_addr: Option<IpAddr>) -> String {
    for name in IP_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            // X-Forwarded-For may carry a chain; the first entry is the client
            let candidate = value.split(',').next().unwrap_or("").trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }
    socket_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// User agent, truncated so a hostile header cannot bloat audit rows
pub fn user_agent(headers: &HeaderMap) -> String {
    let ua = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    if ua.len() > MAX_USER_AGENT_LEN {
        let mut end = MAX_USER_AGENT_LEN;
        while !ua.is_char_boundary(end) {
            end -= 1;
        }
        ua[..end].to_string()
    } else {
        ua.to_string()
    }
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_REGEX.is_match(email)
}

/// Field-level problems with a login submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginInputError {
    MissingEmail,
    InvalidEmail,
    MissingPassword,
}

impl LoginInputError {
    pub fn user_message(&self) -> &'static str {
        match self {
            LoginInputError::MissingEmail => "Email is required.",
            LoginInputError::InvalidEmail => "Please enter a valid email address.",
            LoginInputError::MissingPassword => "Password is required.",
        }
    }
}

/// Syntactic check before any credential work happens
pub fn validate_login_input(email: &str, password: &str) -> Result<(), LoginInputError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(LoginInputError::MissingEmail);
    }
    if !is_valid_email(email) {
        return Err(LoginInputError::InvalidEmail);
    }
    if password.is_empty() {
        return Err(LoginInputError::MissingPassword);
    }
    Ok(())
}
