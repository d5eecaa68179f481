use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Where a device's `expectedPowerKw` figure was sourced from, in priority order
/// (see `power::estimator`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExpectedPowerSource {
    Manual,
    MeasuredPeak,
    LoadSetting,
    PlatformEnergy,
    Default,
}

/// Capabilities a target device may expose. Absent capabilities default to
/// `false`/`None` rather than erroring — the estimator and builder treat a
/// missing capability as "this device cannot do that", not as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub has_onoff: bool,
    pub has_target_temperature: bool,
    pub has_measure_power: bool,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            has_onoff: true,
            has_target_temperature: false,
            has_measure_power: false,
            min_temperature: None,
            max_temperature: None,
        }
    }
}

/// Platform-declared energy hints used by the estimator's rule 4 (§4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyHints {
    pub energy_value_on_kw: Option<f64>,
    pub energy_value_off_kw: Option<f64>,
    pub approximation_kw: Option<f64>,
    pub energy_w: Option<f64>,
}

/// A snapshot of one target device as refreshed by the SDK adapter each
/// cycle. Consumed read-only by the Plan Engine; the `expected_power_*`
/// fields are filled in by `power::estimator` before the Plan Builder runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub zone: Option<String>,

    #[serde(default = "default_true")]
    pub controllable: bool,
    #[serde(default = "default_true")]
    pub managed: bool,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,

    pub current_on: Option<bool>,
    pub current_temperature: Option<f64>,
    pub current_target: Option<f64>,
    pub measured_power_kw: Option<f64>,

    #[serde(default)]
    pub manual_override_kw: Option<f64>,
    #[serde(default)]
    pub load_setting_kw: Option<f64>,
    #[serde(default)]
    pub energy_hints: EnergyHints,

    /// Filled in per cycle by the Power Estimator.
    #[serde(default)]
    pub expected_power_kw: f64,
    #[serde(default = "default_source")]
    pub expected_power_source: ExpectedPowerSource,
    #[serde(default)]
    pub load_kw: Option<f64>,

    #[serde(default = "default_true")]
    pub available: bool,
    pub last_updated: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_source() -> ExpectedPowerSource {
    ExpectedPowerSource::Default
}

impl DeviceSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            zone: None,
            controllable: true,
            managed: true,
            capabilities: DeviceCapabilities::default(),
            current_on: None,
            current_temperature: None,
            current_target: None,
            measured_power_kw: None,
            manual_override_kw: None,
            load_setting_kw: None,
            energy_hints: EnergyHints::default(),
            expected_power_kw: 0.0,
            expected_power_source: ExpectedPowerSource::Default,
            load_kw: None,
            available: true,
            last_updated: now,
        }
    }
}
