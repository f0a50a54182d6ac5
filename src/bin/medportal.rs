use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use medportal::auth::routes::{router, AppState};
use medportal::auth::{AuthService, LockoutPolicy};
use medportal::config::Config;
use medportal::credentials::{CredentialStore, MemoryCredentialStore, PgCredentialStore};
use medportal::database::init_database;
use medportal::security::audit::{AuditStore, Auditor, MemoryAuditStore, PgAuditStore};
use medportal::security::CsrfGuard;
use medportal::session::{MemorySessionStore, PgSessionStore, SessionManager, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "medportal", about = "Role-based medical office portal")]
struct Args {
    /// Bind address, overrides MEDPORTAL_HOST
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides MEDPORTAL_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Skip automatic migrations on startup
    #[arg(long)]
    skip_migrations: bool,

    /// Emit logs as JSON
    #[arg(long, env = "MEDPORTAL_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let timeout = Duration::seconds(config.session_timeout as i64);
    let rotation = Duration::seconds(config.session_rotation_interval as i64);
    let csrf_ttl = Duration::seconds(config.csrf_token_ttl as i64);

    let (users, session_store, audit_store): (
        Arc<dyn CredentialStore>,
        Arc<dyn SessionStore>,
        Arc<dyn AuditStore>,
    ) = match &config.database_url {
        Some(url) => {
            let db = init_database(url, !args.skip_migrations).await?;
            let pool = db.pool().clone();
            (
                Arc::new(PgCredentialStore::new(pool.clone())),
                Arc::new(PgSessionStore::new(pool.clone(), config.session_key_bytes())),
                Arc::new(PgAuditStore::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory stores; all state is lost on restart");
            (
                Arc::new(MemoryCredentialStore::new()),
                Arc::new(MemorySessionStore::new()),
                Arc::new(MemoryAuditStore::new()),
            )
        }
    };

    if config.database_url.is_some() && config.session_key.is_empty() {
        warn!("MEDPORTAL_SESSION_KEY not set, sessions are encrypted with an all-zero key");
    }

    let sessions = Arc::new(SessionManager::new(session_store, timeout, rotation));
    let csrf = Arc::new(CsrfGuard::new(sessions.clone(), csrf_ttl));
    let auth = Arc::new(AuthService::new(
        users.clone(),
        sessions.clone(),
        Auditor::new(audit_store.clone()),
        LockoutPolicy::new(config.max_login_attempts, config.login_lockout_time),
        config.clear_attempts_by_ip,
    ));

    let state = AppState {
        auth,
        sessions,
        csrf,
        users,
        auditor: Arc::new(Auditor::new(audit_store)),
        config: config.clone(),
    };

    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .context("invalid bind address")?;
    info!(%addr, "medportal listening");

    axum_server::bind(addr)
        .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    Ok(())
}
