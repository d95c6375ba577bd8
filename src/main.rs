use std::net::SocketAddr;

use tokio::time::{self, Duration as TokioDuration};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mikki_trade::{config, db, middleware, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging: stdout + daily rotated file under ./logs
    std::fs::create_dir_all("logs").ok();
    let (stdout_nb, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let file_appender = tracing_appender::rolling::daily("logs", "mikki.log");
    let (file_nb, file_guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(stdout_nb))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_nb))
        .init();
    // Keep the guards alive so the non-blocking writers flush
    let _log_guards = (stdout_guard, file_guard);

    // Embedded defaults -> mikki.toml -> $MIKKI_CONFIG -> env/.env
    let app_cfg = config::load()?;

    let db_url = &app_cfg.database.url;
    config::ensure_sqlite_parent_dir(db_url)?;
    let pool = db::create_pool(db_url, 16).await?;

    db::init_db(&pool).await?;
    tokio::fs::create_dir_all(&app_cfg.storage.root).await?;

    let state = AppState::new(pool.clone(), app_cfg.clone());

    if let (Some(email), Some(password)) =
        (app_cfg.auth.bootstrap_admin_email.as_deref(), app_cfg.auth.bootstrap_admin_password.as_deref())
    {
        if state.identity.ensure_admin(email, password).await? {
            info!("Bootstrap admin account created for {}", email);
        }
    }

    spawn_sweepers(&state, pool.clone(), app_cfg.rate_limit.cleanup_interval_secs);

    let app = routes::router(state);
    // CORS: permissive in debug for a separately served dev front end, same-origin in release
    let app = if cfg!(debug_assertions) { app.layer(CorsLayer::permissive()) } else { app };

    let port: u16 = app_cfg.server.port;
    let host: String = app_cfg.server.host.clone();
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen addr {}:{} - {}", host, port, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Mikki Trade Motors listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    Ok(())
}

/// Periodic cleanup of the in-memory security maps and expired sessions.
fn spawn_sweepers(state: &AppState, pool: sqlx::SqlitePool, interval_secs: u64) {
    let period = TokioDuration::from_secs(interval_secs.max(1));
    let state = state.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        loop {
            ticker.tick().await;
            state.rate_limiter.cleanup_all().await;
            state.global_limiter.cleanup_expired().await;
            state.csrf.cleanup_expired().await;
            middleware::auth::expire_idle_sessions(&state).await;
            match db::purge_expired(&pool).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("Purged {} expired session/token rows", n),
                Err(e) => tracing::warn!("Failed to purge expired sessions: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received. Stopping server...");
}
