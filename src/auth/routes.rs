use axum::extract::{ConnectInfo, Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::credentials::{CredentialStore, NewUser, Role, StoreError};
use crate::security::audit::{AuditAction, AuditEntry, Auditor};
use crate::security::request::{client_ip, user_agent, validate_login_input};
use crate::security::CsrfGuard;
use crate::session::{FlashLevel, SessionId, SessionManager};

use super::error::AuthError;
use super::service::{Access, AuthService, ClientInfo};

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub sessions: Arc<SessionManager>,
    pub csrf: Arc<CsrfGuard>,
    pub users: Arc<dyn CredentialStore>,
    pub auditor: Arc<Auditor>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/login") }))
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", axum::routing::post(logout))
        .route("/register", get(register_page).post(register_submit))
        .route("/dashboard", get(dashboard))
        .route("/admin", get(admin_page))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    csrf_token: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Deserialize)]
pub struct LogoutForm {
    #[serde(default)]
    csrf_token: String,
}

#[derive(Deserialize)]
pub struct RegisterForm {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    password: String,
    #[serde(default)]
    csrf_token: String,
}

/// Pull the session id out of the request's cookie header
fn session_from_cookies(headers: &HeaderMap, cookie_name: &str) -> Option<SessionId> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == cookie_name && !value.is_empty())
            .then(|| SessionId::from_cookie_value(value))
    })
}

fn session_cookie(config: &Config, id: &SessionId) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{}",
        config.session_cookie_name,
        id.as_str(),
        config.session_timeout,
        if config.cookie_secure { "; Secure" } else { "" }
    )
}

fn clear_session_cookie(config: &Config) -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0{}",
        config.session_cookie_name,
        if config.cookie_secure { "; Secure" } else { "" }
    )
}

fn with_cookie(cookie: String, response: Response) -> Response {
    let mut response = response;
    match header::HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "invalid session cookie value"),
    }
    response
}

fn flash_html(messages: &std::collections::HashMap<FlashLevel, String>) -> String {
    let mut out = String::new();
    for (level, message) in messages {
        let class = match level {
            FlashLevel::Success => "flash-success",
            FlashLevel::Error => "flash-error",
            FlashLevel::Info => "flash-info",
        };
        out.push_str(&format!(
            "<p class=\"{}\">{}</p>\n",
            class,
            html_escape::encode_text(message)
        ));
    }
    out
}

fn login_form_html(csrf_token: &str, email: &str, error: Option<&str>, flash: &str) -> String {
    let error_html = error
        .map(|e| format!("<p class=\"flash-error\">{}</p>\n", html_escape::encode_text(e)))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>MedPortal Login</title></head>
<body>
<h1>MedPortal</h1>
{flash}{error_html}<form method="post" action="/login">
<input type="hidden" name="csrf_token" value="{csrf}">
<label>Email <input type="email" name="email" value="{email}" required></label>
<label>Password <input type="password" name="password" required></label>
<label>Role
<select name="role">
<option value="">Detect from account</option>
<option value="admin">Administrator</option>
<option value="doctor">Doctor</option>
<option value="nurse">Nurse</option>
<option value="pharmacy">Pharmacy</option>
<option value="accountant">Accountant</option>
<option value="patient">Patient</option>
</select></label>
<button type="submit">Login</button>
</form>
<p><a href="/register">Register as a patient</a></p>
</body>
</html>"#,
        flash = flash,
        error_html = error_html,
        csrf = html_escape::encode_double_quoted_attribute(csrf_token),
        email = html_escape::encode_double_quoted_attribute(email),
    )
}

fn register_form_html(
    csrf_token: &str,
    form: Option<&RegisterForm>,
    error: Option<&str>,
) -> String {
    let error_html = error
        .map(|e| format!("<p class=\"flash-error\">{}</p>\n", html_escape::encode_text(e)))
        .unwrap_or_default();
    let (full_name, email, phone) = form
        .map(|f| {
            (
                f.full_name.as_str(),
                f.email.as_str(),
                f.phone.as_deref().unwrap_or(""),
            )
        })
        .unwrap_or(("", "", ""));
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>MedPortal Registration</title></head>
<body>
<h1>Patient Registration</h1>
{error_html}<form method="post" action="/register">
<input type="hidden" name="csrf_token" value="{csrf}">
<label>Full name <input type="text" name="full_name" value="{full_name}" required></label>
<label>Email <input type="email" name="email" value="{email}" required></label>
<label>Phone <input type="tel" name="phone" value="{phone}"></label>
<label>Password <input type="password" name="password" required></label>
<button type="submit">Register</button>
</form>
<p><a href="/login">Back to login</a></p>
</body>
</html>"#,
        error_html = error_html,
        csrf = html_escape::encode_double_quoted_attribute(csrf_token),
        full_name = html_escape::encode_double_quoted_attribute(full_name),
        email = html_escape::encode_double_quoted_attribute(email),
        phone = html_escape::encode_double_quoted_attribute(phone),
    )
}

fn client_info(headers: &HeaderMap, addr: SocketAddr) -> ClientInfo {
    ClientInfo {
        ip: client_ip(headers, Some(addr.ip())),
        user_agent: user_agent(headers),
    }
}

async fn login_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let sid = session_from_cookies(&headers, &state.config.session_cookie_name);

    // Someone already logged in goes straight to their workspace
    if let Some(sid) = &sid {
        if let Ok(Some(user)) = state.auth.current_user(sid).await {
            return with_cookie(
                session_cookie(&state.config, sid),
                Redirect::to(user.role.landing_path()).into_response(),
            );
        }
    }

    let record = match state.sessions.ensure(sid.as_ref()).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "session start failed");
            return service_unavailable();
        }
    };

    let token = match state.csrf.get_or_issue(&record.id).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "csrf issue failed");
            return service_unavailable();
        }
    };
    let flash = state.sessions.take_flash(&record.id).await.unwrap_or_default();

    let body = login_form_html(&token.value, "", None, &flash_html(&flash));
    with_cookie(
        session_cookie(&state.config, &record.id),
        Html(body).into_response(),
    )
}

async fn login_submit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let sid = session_from_cookies(&headers, &state.config.session_cookie_name);
    let record = match state.sessions.ensure(sid.as_ref()).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "session start failed");
            return service_unavailable();
        }
    };
    let client = client_info(&headers, addr);

    // CSRF comes first; nothing else runs on a bad token
    let csrf_ok = state
        .csrf
        .validate(&record.id, &form.csrf_token)
        .await
        .unwrap_or(false);
    if !csrf_ok {
        return rerender_login(
            &state,
            &record.id,
            &form.email,
            AuthError::CsrfInvalid.user_message(),
        )
        .await;
    }

    if let Err(input_err) = validate_login_input(&form.email, &form.password) {
        return rerender_login(&state, &record.id, &form.email, input_err.user_message()).await;
    }

    let sid = match state
        .auth
        .login(&record.id, &form.email, &form.password, &client)
        .await
    {
        Ok(sid) => sid,
        Err(err) => {
            return rerender_login(&state, &record.id, &form.email, err.user_message()).await;
        }
    };

    let user = match state.auth.current_user(&sid).await {
        Ok(Some(user)) => user,
        _ => return service_unavailable(),
    };

    // An explicitly selected role must match the account's actual role
    if let Some(selected) = form.role.as_deref().filter(|r| !r.is_empty()) {
        if Role::parse(selected) != Some(user.role) {
            state
                .auditor
                .record(AuditEntry::new(
                    Some(user.user_id),
                    AuditAction::LoginRoleMismatch,
                    &client.ip,
                    &client.user_agent,
                ))
                .await;
            return rerender_login(
                &state,
                &sid,
                &form.email,
                "Selected role does not match your account. Please select the correct role.",
            )
            .await;
        }
    }

    with_cookie(
        session_cookie(&state.config, &sid),
        Redirect::to(user.role.landing_path()).into_response(),
    )
}

async fn rerender_login(state: &AppState, sid: &SessionId, email: &str, error: &str) -> Response {
    let token = match state.csrf.get_or_issue(sid).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "csrf issue failed");
            return service_unavailable();
        }
    };
    let flash = state.sessions.take_flash(sid).await.unwrap_or_default();
    let body = login_form_html(&token.value, email, Some(error), &flash_html(&flash));
    with_cookie(
        session_cookie(&state.config, sid),
        (StatusCode::UNPROCESSABLE_ENTITY, Html(body)).into_response(),
    )
}

async fn logout(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<LogoutForm>,
) -> Response {
    let client = client_info(&headers, addr);
    let Some(sid) = session_from_cookies(&headers, &state.config.session_cookie_name) else {
        return with_cookie(
            clear_session_cookie(&state.config),
            Redirect::to("/login").into_response(),
        );
    };

    // A state-changing post needs the token; a cross-site form post
    // carrying only the cookie must not end the session
    let csrf_ok = state
        .csrf
        .validate(&sid, &form.csrf_token)
        .await
        .unwrap_or(false);
    if !csrf_ok {
        return with_cookie(
            session_cookie(&state.config, &sid),
            Redirect::to("/dashboard").into_response(),
        );
    }

    if let Err(e) = state.csrf.clear(&sid).await {
        warn!(error = %e, "csrf clear on logout failed");
    }
    if let Err(e) = state.auth.logout(&sid, &client).await {
        warn!(error = %e, "logout failed");
    }
    with_cookie(
        clear_session_cookie(&state.config),
        Redirect::to("/login").into_response(),
    )
}

async fn register_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let sid = session_from_cookies(&headers, &state.config.session_cookie_name);
    let record = match state.sessions.ensure(sid.as_ref()).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "session start failed");
            return service_unavailable();
        }
    };
    let token = match state.csrf.get_or_issue(&record.id).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "csrf issue failed");
            return service_unavailable();
        }
    };
    with_cookie(
        session_cookie(&state.config, &record.id),
        Html(register_form_html(&token.value, None, None)).into_response(),
    )
}

async fn register_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<RegisterForm>,
) -> Response {
    let sid = session_from_cookies(&headers, &state.config.session_cookie_name);
    let record = match state.sessions.ensure(sid.as_ref()).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "session start failed");
            return service_unavailable();
        }
    };

    let csrf_ok = state
        .csrf
        .validate(&record.id, &form.csrf_token)
        .await
        .unwrap_or(false);
    if !csrf_ok {
        return rerender_register(&state, &record.id, &form, AuthError::CsrfInvalid.user_message())
            .await;
    }

    if let Err(input_err) = validate_login_input(&form.email, &form.password) {
        return rerender_register(&state, &record.id, &form, input_err.user_message()).await;
    }
    if form.full_name.trim().is_empty() {
        return rerender_register(&state, &record.id, &form, "Full name is required.").await;
    }
    if form.password.len() < 8 {
        return rerender_register(
            &state,
            &record.id,
            &form,
            "Password must be at least 8 characters long.",
        )
        .await;
    }

    let new_user = NewUser {
        role: Role::Patient,
        email: form.email.trim().to_lowercase(),
        password: form.password.clone(),
        full_name: form.full_name.trim().to_string(),
        phone: form.phone.clone().filter(|p| !p.trim().is_empty()),
    };
    match state.users.create_user(new_user).await {
        Ok(_) => {
            if let Err(e) = state
                .sessions
                .set_flash(
                    &record.id,
                    FlashLevel::Success,
                    "Registration successful. Please login.",
                )
                .await
            {
                warn!(error = %e, "failed to queue registration flash");
            }
            with_cookie(
                session_cookie(&state.config, &record.id),
                Redirect::to("/login").into_response(),
            )
        }
        Err(StoreError::DuplicateEmail) => {
            rerender_register(&state, &record.id, &form, "Email is already registered.").await
        }
        Err(e) => {
            warn!(error = %e, "registration failed");
            rerender_register(
                &state,
                &record.id,
                &form,
                "System temporarily unavailable. Please try again.",
            )
            .await
        }
    }
}

async fn rerender_register(
    state: &AppState,
    sid: &SessionId,
    form: &RegisterForm,
    error: &str,
) -> Response {
    let token = match state.csrf.get_or_issue(sid).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "csrf issue failed");
            return service_unavailable();
        }
    };
    let body = register_form_html(&token.value, Some(form), Some(error));
    with_cookie(
        session_cookie(&state.config, sid),
        (StatusCode::UNPROCESSABLE_ENTITY, Html(body)).into_response(),
    )
}

async fn dashboard(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let sid = session_from_cookies(&headers, &state.config.session_cookie_name);
    match state.auth.require_auth(sid.as_ref()).await {
        Access::Granted(auth) => {
            let token = match state.csrf.get_or_issue(&auth.id).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "csrf issue failed");
                    return service_unavailable();
                }
            };
            let body = format!(
                r#"<!DOCTYPE html>
<html>
<head><title>Dashboard</title></head>
<body>
<h1>Welcome, {}</h1>
<p>Role: {}</p>
<p><a href="{}">Go to your workspace</a></p>
<form method="post" action="/logout">
<input type="hidden" name="csrf_token" value="{}">
<button type="submit">Logout</button>
</form>
</body>
</html>"#,
                html_escape::encode_text(&auth.user.full_name),
                auth.user.role,
                auth.user.role.landing_path(),
                html_escape::encode_double_quoted_attribute(&token.value),
            );
            with_cookie(
                session_cookie(&state.config, &auth.id),
                Html(body).into_response(),
            )
        }
        Access::Denied {
            redirect_to,
            session,
        } => with_cookie(
            session_cookie(&state.config, &session),
            Redirect::to(redirect_to).into_response(),
        ),
    }
}

async fn admin_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let sid = session_from_cookies(&headers, &state.config.session_cookie_name);
    match state.auth.require_role(sid.as_ref(), Role::Admin).await {
        Access::Granted(auth) => {
            let body = format!(
                r#"<!DOCTYPE html>
<html>
<head><title>Administration</title></head>
<body>
<h1>Administration</h1>
<p>Signed in as {}</p>
</body>
</html>"#,
                html_escape::encode_text(&auth.user.full_name),
            );
            with_cookie(
                session_cookie(&state.config, &auth.id),
                Html(body).into_response(),
            )
        }
        Access::Denied {
            redirect_to,
            session,
        } => with_cookie(
            session_cookie(&state.config, &session),
            Redirect::to(redirect_to).into_response(),
        ),
    }
}

fn service_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Html("<p>System temporarily unavailable. Please try again.</p>"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let config = Config::default();
        let id = SessionId::generate();
        let cookie = session_cookie(&config, &id);
        assert!(cookie.starts_with("MEDPORTAL_SESSION="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=1800"));
        assert!(!cookie.contains("Secure"));

        let secure = Config {
            cookie_secure: true,
            ..Config::default()
        };
        assert!(session_cookie(&secure, &id).ends_with("; Secure"));
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        let config = Config::default();
        assert!(clear_session_cookie(&config).contains("Max-Age=0"));
    }

    #[test]
    fn test_session_extraction_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "theme=dark; MEDPORTAL_SESSION=abc123; lang=en".parse().unwrap(),
        );
        let sid = session_from_cookies(&headers, "MEDPORTAL_SESSION").unwrap();
        assert_eq!(sid.as_str(), "abc123");

        assert!(session_from_cookies(&HeaderMap::new(), "MEDPORTAL_SESSION").is_none());
    }

    #[test]
    fn test_login_form_escapes_user_input() {
        let html = login_form_html("tok", "<script>alert(1)</script>@x.com", None, "");
        assert!(!html.contains("<script>alert"));
    }

    use crate::auth::LockoutPolicy;
    use crate::credentials::MemoryCredentialStore;
    use crate::security::audit::MemoryAuditStore;
    use crate::session::MemorySessionStore;
    use chrono::Duration;

    fn test_state() -> AppState {
        let users = Arc::new(MemoryCredentialStore::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Duration::seconds(1800),
            Duration::seconds(1800),
        ));
        let audit = Arc::new(MemoryAuditStore::new());
        let csrf = Arc::new(CsrfGuard::new(sessions.clone(), Duration::seconds(3600)));
        let auth = Arc::new(AuthService::new(
            users.clone(),
            sessions.clone(),
            Auditor::new(audit.clone()),
            LockoutPolicy::new(5, 900),
            true,
        ));
        AppState {
            auth,
            sessions,
            csrf,
            users,
            auditor: Arc::new(Auditor::new(audit)),
            config: Arc::new(Config::default()),
        }
    }

    async fn logged_in_patient(state: &AppState) -> SessionId {
        state
            .users
            .create_user(NewUser {
                role: Role::Patient,
                email: "pat@example.com".to_string(),
                password: "pat-pass-123".to_string(),
                full_name: "Pat Example".to_string(),
                phone: None,
            })
            .await
            .unwrap();
        let anon = state.sessions.start().await.unwrap();
        state
            .auth
            .login(
                &anon.id,
                "pat@example.com",
                "pat-pass-123",
                &ClientInfo {
                    ip: "127.0.0.1".to_string(),
                    user_agent: "test-agent".to_string(),
                },
            )
            .await
            .unwrap()
    }

    fn cookie_headers(state: &AppState, sid: &SessionId) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("{}={}", state.config.session_cookie_name, sid.as_str())
                .parse()
                .unwrap(),
        );
        headers
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    #[tokio::test]
    async fn test_logout_without_token_keeps_the_session() {
        let state = test_state();
        let sid = logged_in_patient(&state).await;
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        // A cross-site form post carries the cookie but no token
        let response = logout(
            State(state.clone()),
            ConnectInfo(addr),
            cookie_headers(&state, &sid),
            Form(LogoutForm {
                csrf_token: String::new(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/dashboard");
        assert!(state.auth.current_user(&sid).await.unwrap().is_some());

        // A forged token fares no better
        let response = logout(
            State(state.clone()),
            ConnectInfo(addr),
            cookie_headers(&state, &sid),
            Form(LogoutForm {
                csrf_token: "forged-value".to_string(),
            }),
        )
        .await;
        assert_eq!(location(&response), "/dashboard");
        assert!(state.auth.current_user(&sid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_logout_with_matching_token_destroys_the_session() {
        let state = test_state();
        let sid = logged_in_patient(&state).await;
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let token = state.csrf.get_or_issue(&sid).await.unwrap();

        let response = logout(
            State(state.clone()),
            ConnectInfo(addr),
            cookie_headers(&state, &sid),
            Form(LogoutForm {
                csrf_token: token.value,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login");
        assert!(state.auth.current_user(&sid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dashboard_renders_logout_token() {
        let state = test_state();
        let sid = logged_in_patient(&state).await;

        let response = dashboard(State(state.clone()), cookie_headers(&state, &sid)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        let token = state.csrf.get_or_issue(&sid).await.unwrap();
        assert!(html.contains(&format!(
            "<input type=\"hidden\" name=\"csrf_token\" value=\"{}\">",
            token.value
        )));
    }

    #[tokio::test]
    async fn test_login_page_redirects_authenticated_visitor() {
        let state = test_state();
        let sid = logged_in_patient(&state).await;

        let response = login_page(State(state.clone()), cookie_headers(&state, &sid)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/patient");

        // An anonymous visitor still gets the form
        let response = login_page(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
