//! Shared setup for auth-service integration tests.
//!
//! Everything runs against the in-memory stores, so no Postgres or Redis is needed.

#![allow(dead_code)]

use auth_service::{
    build_router,
    config::{
        AuthConfig, DatabaseConfig, Environment, JwtConfig, NotificationConfig, RateLimitConfig,
        RedisConfig, SecurityConfig, SmsConfig, VerificationConfig,
    },
    services::{
        notification::{MockMailer, MockSmsSender},
        notification_channel, AuthService, InMemoryAuthEventLog, InMemoryCredentialStore,
        InMemorySessionStore, InMemoryVerificationStore, JwtService, VerificationService,
    },
    AppState,
};
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, Response},
    Router,
};
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub const ACCESS_SECRET: &str = "test-access-secret";
pub const REFRESH_SECRET: &str = "test-refresh-secret";
pub const USER_AGENT: &str = "integration-test/1.0";

pub fn test_config() -> AuthConfig {
    AuthConfig {
        common: service_core::config::Config { port: 0 },
        environment: Environment::Dev,
        service_name: "auth-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        jwt: JwtConfig {
            access_secret: ACCESS_SECRET.to_string(),
            refresh_secret: REFRESH_SECRET.to_string(),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 2_592_000,
        },
        verification: VerificationConfig {
            email_ttl_seconds: 86_400,
            phone_ttl_seconds: 600,
            public_base_url: "http://auth.test".to_string(),
        },
        smtp: None,
        sms: SmsConfig {
            gateway_url: None,
            from: "TaskAuth".to_string(),
        },
        notification: NotificationConfig { queue_size: 64 },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            cookie_secure: false,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 1000,
            login_window_seconds: 60,
            register_attempts: 1000,
            register_window_seconds: 60,
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        },
    }
}

/// Fully wired application plus handles on every in-memory backend.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub users: Arc<InMemoryCredentialStore>,
    pub sessions: Arc<InMemorySessionStore>,
    pub events: Arc<InMemoryAuthEventLog>,
    pub verifications: Arc<InMemoryVerificationStore>,
    pub mailer: Arc<MockMailer>,
    pub sms: Arc<MockSmsSender>,
}

/// Must be called inside a tokio runtime; the notification dispatcher is spawned.
pub fn test_app() -> TestApp {
    test_app_with(test_config())
}

pub fn test_app_with(config: AuthConfig) -> TestApp {
    let users = Arc::new(InMemoryCredentialStore::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let events = Arc::new(InMemoryAuthEventLog::new());
    let verifications = Arc::new(InMemoryVerificationStore::new());
    let mailer = Arc::new(MockMailer::new());
    let sms = Arc::new(MockSmsSender::new());

    let (queue, dispatcher) =
        notification_channel(config.notification.queue_size, mailer.clone(), sms.clone());
    dispatcher.spawn();

    let auth = AuthService::new(
        users.clone(),
        sessions.clone(),
        JwtService::new(&config.jwt),
        events.clone(),
    );
    let verification = VerificationService::new(
        verifications.clone(),
        users.clone(),
        queue,
        config.verification.clone(),
        Some(config.sms.from.clone()),
    );

    let state = AppState {
        login_rate_limiter: create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        ),
        register_rate_limiter: create_ip_rate_limiter(
            config.rate_limit.register_attempts,
            config.rate_limit.register_window_seconds,
        ),
        ip_rate_limiter: create_ip_rate_limiter(
            config.rate_limit.global_ip_limit,
            config.rate_limit.global_ip_window_seconds,
        ),
        config,
        auth,
        verification,
        sessions: sessions.clone(),
    };

    TestApp {
        router: build_router(state.clone()),
        state,
        users,
        sessions,
        events,
        verifications,
        mailer,
        sms,
    }
}

/// Request builder preloaded with a fingerprintable user agent and a peer address.
pub fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::USER_AGENT, USER_AGENT)
        .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
}

pub fn json_body(builder: axum::http::request::Builder, body: serde_json::Value) -> Request<Body> {
    builder
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Raw `Set-Cookie` lines keyed by cookie name.
pub fn set_cookies(response: &Response<Body>) -> HashMap<String, String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|line| {
            let name = line.split('=').next()?.trim().to_string();
            Some((name, line.to_string()))
        })
        .collect()
}

/// Value of a cookie from its `Set-Cookie` line.
pub fn cookie_value(line: &str) -> String {
    line.split(';')
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(_, v)| v.to_string())
        .unwrap_or_default()
}

/// Poll until the dispatcher has handed off the expected number of messages.
pub async fn wait_for<F: Fn() -> bool>(ready: F) {
    for _ in 0..200 {
        if ready() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
