use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use validator::Validate;

use crate::services::erp::SyncError;

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value", key)),
        _ => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("{} must be a boolean, got '{}'", key, other),
        },
        Err(_) => Ok(default),
    }
}

/// Parse `field=strategy,field=strategy` pairs.
pub fn parse_field_strategies(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (field, strategy) = pair
                .split_once('=')
                .with_context(|| format!("field strategy '{}' is not field=strategy", pair))?;
            Ok((field.trim().to_string(), strategy.trim().to_string()))
        })
        .collect()
}

// ============================================================================
// Database
// ============================================================================

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("DATABASE_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_or("DATABASE_PORT", 5432)?,
            username: env::var("DATABASE_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: env::var("DATABASE_PASSWORD").context("DATABASE_PASSWORD must be set")?,
            database: env::var("DATABASE_NAME").unwrap_or_else(|_| "customer_sync".to_string()),
            ssl_mode: env::var("DATABASE_SSL_MODE").unwrap_or_else(|_| "prefer".to_string()),
        })
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.username, self.password, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub async fn connect(&self) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.connection_string())
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(pool)
    }
}

// ============================================================================
// ERP Connection
// ============================================================================

#[derive(Debug, Clone)]
pub struct ErpConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub serial_number: String,
    pub timeout_secs: u64,
}

impl ErpConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env::var("ERP_BASE_URL").context("ERP_BASE_URL must be set")?,
            username: env::var("ERP_USERNAME").context("ERP_USERNAME must be set")?,
            password: env::var("ERP_PASSWORD").context("ERP_PASSWORD must be set")?,
            serial_number: env::var("ERP_SERIAL_NUMBER")
                .unwrap_or_else(|_| "customer_erp_sync_001".to_string()),
            timeout_secs: env_or("ERP_TIMEOUT_SECS", 30)?,
        })
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PullJobConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_seconds: u64,
    #[validate(range(min = 1, max = 1000))]
    pub page_size: u32,
    pub incremental: bool,
}

impl Default for PullJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
            page_size: 100,
            incremental: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PushJobConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_seconds: u64,
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u32,
}

impl Default for PushJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 1800,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    #[validate(nested)]
    pub erp_pull: PullJobConfig,
    #[validate(nested)]
    pub erp_push: PushJobConfig,
    pub run_on_start: bool,
    #[validate(range(min = 1))]
    pub stop_timeout_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            erp_pull: PullJobConfig::default(),
            erp_push: PushJobConfig::default(),
            run_on_start: false,
            stop_timeout_secs: 5,
            error_backoff_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            erp_pull: PullJobConfig {
                enabled: env_flag("ERP_PULL_ENABLED", defaults.erp_pull.enabled)?,
                interval_seconds: env_or("ERP_PULL_INTERVAL_SECONDS", defaults.erp_pull.interval_seconds)?,
                page_size: env_or("ERP_PULL_PAGE_SIZE", defaults.erp_pull.page_size)?,
                incremental: env_flag("ERP_PULL_INCREMENTAL", defaults.erp_pull.incremental)?,
            },
            erp_push: PushJobConfig {
                enabled: env_flag("ERP_PUSH_ENABLED", defaults.erp_push.enabled)?,
                interval_seconds: env_or("ERP_PUSH_INTERVAL_SECONDS", defaults.erp_push.interval_seconds)?,
                batch_size: env_or("ERP_PUSH_BATCH_SIZE", defaults.erp_push.batch_size)?,
            },
            run_on_start: env_flag("ERP_SYNC_RUN_ON_START", defaults.run_on_start)?,
            stop_timeout_secs: env_or("ERP_SYNC_STOP_TIMEOUT_SECS", defaults.stop_timeout_secs)?,
            error_backoff_secs: env_or("ERP_SYNC_ERROR_BACKOFF_SECS", defaults.error_backoff_secs)?,
        })
    }

    pub fn check(&self) -> std::result::Result<(), SyncError> {
        self.validate()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))
    }
}

// ============================================================================
// Sync Behaviour
// ============================================================================

/// Settings consumed by the sync service itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    pub pull_page_size: u32,
    /// `sort1` sent with newly created ERP customers
    pub default_follow_level: String,
    /// `ly` sent with newly created ERP customers
    pub customer_source_id: String,
    /// Per-field overrides for the change detector, keyed by local field name
    pub field_strategies: HashMap<String, String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            pull_page_size: 100,
            default_follow_level: "潜在客户".to_string(),
            customer_source_id: "484".to_string(),
            field_strategies: HashMap::new(),
        }
    }
}

impl SyncOptions {
    pub fn from_env(pull_page_size: u32) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            pull_page_size,
            default_follow_level: env::var("ERP_DEFAULT_FOLLOW_LEVEL")
                .unwrap_or(defaults.default_follow_level),
            customer_source_id: env::var("ERP_CUSTOMER_SOURCE_ID")
                .unwrap_or(defaults.customer_source_id),
            field_strategies: match env::var("ERP_FIELD_STRATEGIES") {
                Ok(raw) => parse_field_strategies(&raw)?,
                Err(_) => HashMap::new(),
            },
        })
    }
}

// ============================================================================
// Application
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub erp: ErpConfig,
    pub scheduler: SchedulerConfig,
    pub sync: SyncOptions,
    pub server_host: String,
    pub server_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let scheduler = SchedulerConfig::from_env()?;
        scheduler.check()?;
        let sync = SyncOptions::from_env(scheduler.erp_pull.page_size)?;

        Ok(Self {
            database: DatabaseConfig::from_env()?,
            erp: ErpConfig::from_env()?,
            scheduler,
            sync,
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env_or("SERVER_PORT", 8080)?,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
