use serde::{Deserialize, Serialize};

/// Where the effective soft limit currently comes from (§3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SoftLimitSource {
    #[default]
    Capacity,
    Daily,
    Both,
}

/// Opaque daily-budget state as produced by the (out-of-scope) learning
/// model. The core only reads this; it never computes or persists it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBudgetSnapshot {
    pub enabled: bool,
    pub hourly_allowance_kwh: f64,
    pub daily_remaining_kwh: f64,
    pub exceeded: bool,
    pub soft_limit_kw: Option<f64>,
    pub soft_limit_source: SoftLimitSource,
    pub hour_controlled_kwh: f64,
    pub hour_uncontrolled_kwh: f64,
    pub minutes_remaining: f64,
}

impl DailyBudgetSnapshot {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            hourly_allowance_kwh: 0.0,
            daily_remaining_kwh: 0.0,
            exceeded: false,
            soft_limit_kw: None,
            soft_limit_source: SoftLimitSource::Capacity,
            hour_controlled_kwh: 0.0,
            hour_uncontrolled_kwh: 0.0,
            minutes_remaining: 60.0,
        }
    }
}
