pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raw telemetry shape handed up by the platform SDK (§6, "Inbound").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTelemetry {
    pub id: String,
    pub name: String,
    pub zone: Option<String>,
    pub available: bool,
    pub has_onoff: bool,
    pub has_target_temperature: bool,
    pub has_measure_power: bool,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub current_on: Option<bool>,
    pub current_temperature: Option<f64>,
    pub current_target: Option<f64>,
    pub measured_power_kw: Option<f64>,
    pub load_setting_kw: Option<f64>,
    pub energy_value_on_kw: Option<f64>,
    pub energy_value_off_kw: Option<f64>,
    pub approximation_kw: Option<f64>,
    pub energy_w: Option<f64>,
}

/// Boundary to the target-home platform. The shipped implementation
/// (`simulated::InMemoryDeviceSdk`) is a real, runnable in-process
/// simulation used by tests; production deployments plug in a platform-
/// specific adapter behind the same trait.
#[async_trait]
pub trait DeviceSdk: Send + Sync {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceTelemetry>>;
    async fn set_onoff(&self, device_id: &str, on: bool) -> anyhow::Result<()>;
    async fn set_target_temperature(&self, device_id: &str, celsius: f64) -> anyhow::Result<()>;
    async fn mark_unavailable(&self, device_id: &str);
}
