use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

use crate::utils::parse_ttl;

pub const DEFAULT_ACCESS_TTL_SECONDS: u64 = 15 * 60;
pub const DEFAULT_REFRESH_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_EMAIL_VERIFY_TTL_SECONDS: u64 = 24 * 60 * 60;
pub const DEFAULT_PHONE_VERIFY_TTL_SECONDS: u64 = 10 * 60;
/// Upper bound for every configured TTL (ten years).
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub verification: VerificationConfig,
    pub smtp: Option<SmtpConfig>,
    pub sms: SmsConfig,
    pub notification: NotificationConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Shared secrets and lifetimes for the two token kinds.
#[derive(Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_secret", &"***")
            .field("refresh_secret", &"***")
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    pub email_ttl_seconds: u64,
    pub phone_ttl_seconds: u64,
    /// Base for links placed in verification emails.
    pub public_base_url: String,
}

#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("from", &self.from)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    /// When unset, SMS messages are only logged.
    pub gateway_url: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub queue_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = AuthConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("auth-service"), is_prod)?,
            service_version: get_env(
                "SERVICE_VERSION",
                Some(env!("CARGO_PKG_VERSION")),
                is_prod,
            )?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
                min_connections: get_env("DATABASE_MIN_CONNECTIONS", Some("1"), is_prod)?
                    .parse()
                    .unwrap_or(1),
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                access_secret: get_env("JWT_ACCESS_SECRET", None, is_prod)?,
                refresh_secret: get_env("JWT_REFRESH_SECRET", None, is_prod)?,
                access_ttl_seconds: parse_ttl(
                    Some(&get_env("JWT_ACCESS_TTL", Some("15m"), is_prod)?),
                    DEFAULT_ACCESS_TTL_SECONDS,
                ),
                refresh_ttl_seconds: parse_ttl(
                    Some(&get_env("JWT_REFRESH_TTL", Some("30d"), is_prod)?),
                    DEFAULT_REFRESH_TTL_SECONDS,
                ),
            },
            verification: VerificationConfig {
                email_ttl_seconds: parse_ttl(
                    Some(&get_env("EMAIL_VERIFY_TTL", Some("24h"), is_prod)?),
                    DEFAULT_EMAIL_VERIFY_TTL_SECONDS,
                ),
                phone_ttl_seconds: parse_ttl(
                    Some(&get_env("PHONE_VERIFY_TTL", Some("10m"), is_prod)?),
                    DEFAULT_PHONE_VERIFY_TTL_SECONDS,
                ),
                public_base_url: get_env(
                    "PUBLIC_BASE_URL",
                    Some("http://localhost:8080"),
                    is_prod,
                )?
                .trim_end_matches('/')
                .to_string(),
            },
            smtp: match get_optional_env("SMTP_HOST") {
                Some(host) => Some(SmtpConfig {
                    host,
                    port: get_env("SMTP_PORT", Some("587"), is_prod)?
                        .parse()
                        .unwrap_or(587),
                    user: get_env("SMTP_USER", None, is_prod)?,
                    password: get_env("SMTP_PASSWORD", None, is_prod)?,
                    from: get_env("MAIL_FROM", None, is_prod)?,
                }),
                None if is_prod => {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "SMTP_HOST is required in production but not set"
                    )))
                }
                None => None,
            },
            sms: SmsConfig {
                gateway_url: get_optional_env("SMS_GATEWAY_URL"),
                from: get_env("SMS_FROM", Some("TaskAuth"), is_prod)?,
            },
            notification: NotificationConfig {
                queue_size: get_env("NOTIFICATION_QUEUE_SIZE", Some("256"), is_prod)?
                    .parse()
                    .unwrap_or(256),
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                cookie_secure: get_env("COOKIE_SECURE", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(false),
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                login_window_seconds: get_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(900),
                register_attempts: get_env("RATE_LIMIT_REGISTER_ATTEMPTS", Some("3"), is_prod)?
                    .parse()
                    .unwrap_or(3),
                register_window_seconds: get_env(
                    "RATE_LIMIT_REGISTER_WINDOW_SECONDS",
                    Some("3600"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(3600),
                global_ip_limit: get_env("RATE_LIMIT_GLOBAL_IP_LIMIT", Some("100"), is_prod)?
                    .parse()
                    .unwrap_or(100),
                global_ip_window_seconds: get_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(60),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_secret.is_empty() || self.jwt.refresh_secret.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_SECRET and JWT_REFRESH_SECRET must not be empty"
            )));
        }

        if self.jwt.access_secret == self.jwt.refresh_secret {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_SECRET and JWT_REFRESH_SECRET must differ"
            )));
        }

        if self.jwt.access_ttl_seconds == 0 || self.jwt.refresh_ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TTL and JWT_REFRESH_TTL must be positive"
            )));
        }

        let ttls = [
            ("JWT_ACCESS_TTL", self.jwt.access_ttl_seconds),
            ("JWT_REFRESH_TTL", self.jwt.refresh_ttl_seconds),
            ("EMAIL_VERIFY_TTL", self.verification.email_ttl_seconds),
            ("PHONE_VERIFY_TTL", self.verification.phone_ttl_seconds),
        ];
        if let Some((name, _)) = ttls.iter().find(|(_, ttl)| *ttl > MAX_TTL_SECONDS) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{} must not exceed {} seconds",
                name,
                MAX_TTL_SECONDS
            )));
        }

        if self.notification.queue_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "NOTIFICATION_QUEUE_SIZE must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.security.cookie_secure {
                tracing::warn!("COOKIE_SECURE is false in production");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

/// Variables whose absence switches a feature off in every environment.
fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
