use auth_service::{
    build_router,
    config::AuthConfig,
    db,
    services::{
        metrics::init_metrics,
        notification::{mailer, sms_sender},
        notification_channel, AuthService, DeviceSessionStore, JwtService, PgCredentialStore,
        RedisAuthEventLog, RedisService, RedisSessionStore, RedisVerificationStore,
        VerificationService,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    init_metrics().map_err(|e| AppError::ConfigError(e.into()))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting authentication service"
    );

    tracing::info!("Initializing database connections");
    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database initialized successfully");

    let redis = RedisService::new(&config.redis).await?;
    tracing::info!("Redis service initialized");

    let jwt = JwtService::new(&config.jwt);

    let mailer = mailer(config.smtp.as_ref()).map_err(AppError::ConfigError)?;
    let sms = sms_sender(&config.sms).map_err(AppError::ConfigError)?;
    let (queue, dispatcher) = notification_channel(config.notification.queue_size, mailer, sms);
    let dispatcher_shutdown = dispatcher.shutdown_token();
    let dispatcher_handle = dispatcher.spawn();
    tracing::info!(
        queue_size = config.notification.queue_size,
        "Notification dispatcher started"
    );

    let users = Arc::new(PgCredentialStore::new(pool));
    let sessions: Arc<dyn DeviceSessionStore> = Arc::new(RedisSessionStore::new(redis.manager()));
    let events = Arc::new(RedisAuthEventLog::new(redis.manager()));
    let verifications = Arc::new(RedisVerificationStore::new(redis.manager()));

    let auth = AuthService::new(users.clone(), sessions.clone(), jwt, events);
    let verification = VerificationService::new(
        verifications,
        users,
        queue,
        config.verification.clone(),
        Some(config.sms.from.clone()),
    );

    let login_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.login_attempts,
        config.rate_limit.login_window_seconds,
    );
    let register_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.register_attempts,
        config.rate_limit.register_window_seconds,
    );
    let ip_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.global_ip_limit,
        config.rate_limit.global_ip_window_seconds,
    );
    tracing::info!("Rate limiters initialized: Login, Register and Global IP");

    let state = AppState {
        config: config.clone(),
        auth,
        verification,
        sessions,
        login_rate_limiter,
        register_rate_limiter,
        ip_rate_limiter,
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop consuming the queue.
    dispatcher_shutdown.cancel();
    if let Err(e) = dispatcher_handle.await {
        tracing::error!(error = %e, "Notification dispatcher did not stop cleanly");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
