//! Configuration module for fee-ledger-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

use crate::services::reconciliation::DEFAULT_CHECKOUT_TTL_MINUTES;
use crate::services::retry::LockRetryPolicy;

#[derive(Debug, Clone)]
pub struct FeeLedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
    pub tenancy: TenancyConfig,
    pub ledger: LedgerConfig,
    pub signing: SigningConfig,
}

#[derive(Debug, Clone)]
pub enum StoreConfig {
    Postgres(DatabaseConfig),
    /// Process-local store for development; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Platform-wide Razorpay webhook secret, used when a tenant has none.
    pub webhook_secret: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct TenancyConfig {
    pub root_domains: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub lock_retry: LockRetryPolicy,
    /// How long an open checkout holds its amount against the fee.
    pub checkout_ttl: chrono::Duration,
}

/// HMAC request signing for the school portal's admin calls.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    /// When false, unsigned requests may read but never act as a user.
    pub required: bool,
    pub client_id: String,
    pub secret: Secret<String>,
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_root_domains(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

impl FeeLedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let store = match env::var("LEDGER_STORE").as_deref() {
            Ok("memory") => StoreConfig::Memory,
            Ok("postgres") | Err(_) => StoreConfig::Postgres(DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            }),
            Ok(other) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "LEDGER_STORE must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let webhook_secret = env::var("RAZORPAY_WEBHOOK_SECRET").map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("RAZORPAY_WEBHOOK_SECRET is required"))
        })?;

        let root_domains = parse_root_domains(
            &env::var("PLATFORM_ROOT_DOMAINS").unwrap_or_else(|_| "localhost".to_string()),
        );
        if root_domains.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PLATFORM_ROOT_DOMAINS must name at least one domain"
            )));
        }

        let signing_secret = env::var("REQUEST_SIGNING_SECRET").map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("REQUEST_SIGNING_SECRET is required"))
        })?;
        if signing_secret.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REQUEST_SIGNING_SECRET must be at least 32 characters"
            )));
        }

        let defaults = LockRetryPolicy::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "fee-ledger-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            store,
            gateway: GatewayConfig {
                webhook_secret: Secret::new(webhook_secret),
            },
            tenancy: TenancyConfig { root_domains },
            ledger: LedgerConfig {
                lock_retry: LockRetryPolicy {
                    max_retries: parse_env("LEDGER_LOCK_RETRIES", defaults.max_retries),
                    initial_interval: Duration::from_millis(parse_env(
                        "LEDGER_LOCK_RETRY_INITIAL_MS",
                        defaults.initial_interval.as_millis() as u64,
                    )),
                    max_interval: Duration::from_millis(parse_env(
                        "LEDGER_LOCK_RETRY_MAX_MS",
                        defaults.max_interval.as_millis() as u64,
                    )),
                },
                checkout_ttl: chrono::Duration::minutes(parse_env(
                    "LEDGER_CHECKOUT_TTL_MINUTES",
                    DEFAULT_CHECKOUT_TTL_MINUTES,
                )),
            },
            signing: SigningConfig {
                required: parse_env("REQUEST_SIGNING_REQUIRED", true),
                client_id: env::var("REQUEST_SIGNING_CLIENT_ID")
                    .unwrap_or_else(|_| "school-portal".to_string()),
                secret: Secret::new(signing_secret),
            },
        })
    }
}
