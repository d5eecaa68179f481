#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration, loaded once at startup (§2.1).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub controller: ControllerConfig,

    #[validate(nested)]
    pub capacity: CapacityDefaultsConfig,

    #[validate(nested)]
    pub daily_budget: DailyBudgetConfig,

    #[validate(nested)]
    pub price: PriceConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub settings_store: SettingsStoreConfig,
}

/// HTTP status-surface configuration (§6.1).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default)]
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse status-server socket address")
    }
}

/// Rebuild-loop timing (§5.1).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ControllerConfig {
    #[validate(range(min = 1, max = 3600))]
    pub tick_seconds: u64,

    #[validate(length(min = 1))]
    pub time_zone: String,

    #[serde(default = "default_retain_hours")]
    #[validate(range(min = 2, max = 168))]
    pub retain_hours: u32,
}

fn default_retain_hours() -> u32 {
    26
}

/// Defaults used when the settings store has no `capacity_*` keys yet, and
/// the validation floor for values written through the Flow "set capacity
/// limit" action.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CapacityDefaultsConfig {
    #[validate(range(min = 0.1, max = 1000.0))]
    pub limit_kw: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub margin_kw: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub restore_margin_kw: f64,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_mode")]
    pub default_mode: String,
}

fn default_mode() -> String {
    "Home".to_string()
}

/// Bounds for the "set daily budget" Flow action (§6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DailyBudgetConfig {
    #[serde(default)]
    pub enabled: bool,

    #[validate(range(min = 0.0, max = 1000.0))]
    pub min_kwh: f64,

    #[validate(range(min = 0.0, max = 1000.0))]
    pub max_kwh: f64,
}

/// Price-level classification thresholds (§4.7).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PriceConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub threshold_pct: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub min_diff_per_kwh: f64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 0.10,
            min_diff_per_kwh: 0.10,
        }
    }
}

/// Logging configuration (§2.1).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings-store backing file (§2.1, §6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SettingsStoreConfig {
    pub path: PathBuf,
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 8089,
        enable_cors: false,
    }
}

fn default_controller() -> ControllerConfig {
    ControllerConfig {
        tick_seconds: 10,
        time_zone: "Europe/Oslo".to_string(),
        retain_hours: 26,
    }
}

fn default_capacity() -> CapacityDefaultsConfig {
    CapacityDefaultsConfig {
        limit_kw: 10.0,
        margin_kw: 0.2,
        restore_margin_kw: 0.3,
        dry_run: false,
        default_mode: default_mode(),
    }
}

fn default_daily_budget() -> DailyBudgetConfig {
    DailyBudgetConfig {
        enabled: false,
        min_kwh: 0.0,
        max_kwh: 100.0,
    }
}

fn default_settings_store() -> SettingsStoreConfig {
    SettingsStoreConfig {
        path: PathBuf::from("data/settings.json"),
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            controller: default_controller(),
            capacity: default_capacity(),
            daily_budget: default_daily_budget(),
            price: PriceConfig::default(),
            telemetry: TelemetryConfig {
                log_level: default_log_level(),
                log_json: false,
            },
            settings_store: default_settings_store(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/default.toml`, optionally layered
    /// with `config/<env>.toml`, then `CAPG__`-prefixed environment
    /// variables, matching the teacher crate's figment layering.
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let defaults_value = figment::providers::Serialized::defaults(&defaults);

        let mut figment = Figment::from(defaults_value).merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        } else {
            figment = figment.merge(Toml::file("config/development.toml").nested());
        }

        figment = figment.merge(Env::prefixed("CAPG__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;

        config
            .validate()
            .context("configuration validation failed")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn socket_addr_parses() {
        let server = default_server();
        let addr = server.socket_addr().unwrap();
        assert_eq!(addr.port(), 8089);
    }

    #[test]
    fn rejects_negative_limit() {
        let mut cfg = AppConfig::default();
        cfg.capacity.limit_kw = -1.0;
        assert!(cfg.validate().is_err());
    }
}
