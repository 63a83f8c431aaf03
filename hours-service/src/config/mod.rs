//! Configuration module for hours-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct HoursConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub policy: HoursPolicyConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Studio policy knobs applied by the administrative commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoursPolicyConfig {
    /// Upper bound on accumulated rollover at period advance. `None` is uncapped.
    pub rollover_cap_hours: Option<Decimal>,
    /// Change-request quota used when an assignment does not name one.
    pub default_change_requests: i32,
}

impl Default for HoursPolicyConfig {
    fn default() -> Self {
        Self {
            rollover_cap_hours: None,
            default_change_requests: 5,
        }
    }
}

impl HoursPolicyConfig {
    fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let rollover_cap_hours = match env::var("ROLLOVER_CAP_HOURS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let cap: Decimal = raw.trim().parse().map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("ROLLOVER_CAP_HOURS is invalid: {}", e))
                })?;
                if cap.is_sign_negative() {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "ROLLOVER_CAP_HOURS must not be negative"
                    )));
                }
                Some(cap)
            }
            _ => defaults.rollover_cap_hours,
        };

        let default_change_requests = env::var("DEFAULT_CHANGE_REQUESTS")
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .filter(|n| *n >= 0)
            .unwrap_or(defaults.default_change_requests);

        Ok(Self {
            rollover_cap_hours,
            default_change_requests,
        })
    }
}

impl HoursConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "hours-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            policy: HoursPolicyConfig::from_env()?,
        })
    }
}
