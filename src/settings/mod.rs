pub mod json_file;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Settings keys the core reads and writes (§6, "enumerated, stable").
pub mod keys {
    pub const CAPACITY_LIMIT_KW: &str = "capacity_limit_kw";
    pub const CAPACITY_MARGIN_KW: &str = "capacity_margin_kw";
    pub const CAPACITY_RESTORE_MARGIN_KW: &str = "capacity_restore_margin_kw";
    pub const CAPACITY_DRY_RUN: &str = "capacity_dry_run";
    pub const MODE_DEVICE_TARGETS: &str = "mode_device_targets";
    pub const MODE_ALIASES: &str = "mode_aliases";
    pub const CAPACITY_PRIORITIES: &str = "capacity_priorities";
    pub const OPERATING_MODE: &str = "operating_mode";
    pub const CONTROLLABLE_DEVICES: &str = "controllable_devices";
    pub const MANAGED_DEVICES: &str = "managed_devices";
    pub const OVERSHOOT_BEHAVIORS: &str = "overshoot_behaviors";
    pub const PRICE_OPTIMIZATION_ENABLED: &str = "price_optimization_enabled";
    pub const PRICE_OPTIMIZATION_SETTINGS: &str = "price_optimization_settings";
    pub const COMBINED_PRICES: &str = "combined_prices";
    pub const DAILY_BUDGET_ENABLED: &str = "daily_budget_enabled";
    pub const DAILY_BUDGET_KWH: &str = "daily_budget_kwh";
    pub const POWER_TRACKER_STATE: &str = "power_tracker_state";
    pub const EXPECTED_POWER_PEAKS: &str = "expected_power_peaks";
    pub const DEVICE_PLAN_SNAPSHOT: &str = "device_plan_snapshot";
    pub const PELS_STATUS: &str = "pels_status";
    pub const CAPACITY_IN_SHORTFALL: &str = "capacity_in_shortfall";
}

/// Opaque JSON key/value store with change notification on `set` (§6).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;
    async fn subscribe(&self) -> broadcast::Receiver<String>;
}
