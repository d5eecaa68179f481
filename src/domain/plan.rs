use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::budget::SoftLimitSource;
use super::mode::ShedBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CurrentState {
    On,
    Off,
    Unknown,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlannedState {
    Keep,
    Shed,
}

/// What currently constrains the plan, surfaced to the UI (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitReason {
    #[default]
    None,
    Hourly,
    Daily,
    Both,
}

/// Plan-wide metadata: the numbers behind the per-device decisions (§3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMeta {
    pub total_kw: Option<f64>,
    pub soft_limit_kw: f64,
    pub capacity_soft_limit_kw: f64,
    pub daily_soft_limit_kw: Option<f64>,
    pub soft_limit_source: SoftLimitSource,
    pub headroom_kw: Option<f64>,
    pub used_kwh: f64,
    pub budget_kwh: f64,
    pub daily_budget_hour_kwh: Option<f64>,
    pub hourly_budget_exhausted: bool,
    pub controlled_kw: f64,
    pub uncontrolled_kw: f64,
    pub minutes_remaining: f64,
    pub daily_budget_remaining_kwh: Option<f64>,
    pub daily_budget_exceeded: Option<bool>,
    pub limit_reason: LimitReason,
}

/// One device's row in a `DevicePlan` (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePlanRow {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub current_state: CurrentState,
    pub current_target: Option<f64>,
    pub planned_state: PlannedState,
    pub planned_target: Option<f64>,
    pub shed_action: Option<ShedBehavior>,
    pub shed_temperature: Option<f64>,
    pub reason: String,
    pub power_kw: f64,
    pub expected_power_kw: f64,
    pub measured_power_kw: Option<f64>,
    pub controllable: bool,
    pub managed: bool,
}

/// The primary Plan Engine output (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePlan {
    pub meta: PlanMeta,
    pub devices: Vec<DevicePlanRow>,
}

impl DevicePlan {
    pub fn shed_ids(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|d| d.planned_state == PlannedState::Shed)
            .map(|d| d.id.as_str())
            .collect()
    }
}
