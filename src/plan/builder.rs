use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::budget::{DailyBudgetSnapshot, SoftLimitSource};
use crate::domain::device::DeviceSnapshot;
use crate::domain::mode::{ModeConfig, ShedBehavior};
use crate::domain::plan::{CurrentState, DevicePlan, DevicePlanRow, LimitReason, PlanMeta, PlannedState};
use crate::domain::price::{PriceLevel, PriceOptimizationConfig};

use super::state::PlanEngineState;

pub const RESTORE_MARGIN_KW: f64 = 0.3;
pub const RESTORE_COOLDOWN: Duration = Duration::from_secs(300);
pub const SWAP_SETTLE_MS: i64 = 60_000;

/// Snapshot of the Capacity Guard's relevant fields, passed in rather than
/// borrowing the Guard directly so the builder stays a pure function of its
/// inputs (§4.4: "pure function on snapshot + state; it never throws").
#[derive(Debug, Clone, Copy)]
pub struct GuardSnapshot {
    pub total_kw: Option<f64>,
    pub capacity_soft_limit_kw: f64,
    pub restore_margin_kw: f64,
    pub shedding_active: bool,
}

/// Everything the Plan Builder needs for one cycle.
pub struct PlanBuilderInput<'a> {
    pub devices: &'a [DeviceSnapshot],
    pub mode: &'a str,
    pub mode_config: &'a ModeConfig,
    pub shed_behaviors: &'a HashMap<String, ShedBehavior>,
    pub guard: GuardSnapshot,
    pub daily_budget: DailyBudgetSnapshot,
    pub price_level: PriceLevel,
    pub price_optimization: PriceOptimizationConfig,
    pub current_hour_used_kwh: f64,
    pub current_hour_budget_kwh: f64,
    pub controlled_kw: f64,
    pub uncontrolled_kw: f64,
    pub minutes_remaining: f64,
    pub now: DateTime<Utc>,
}

struct DynamicSoftLimit {
    soft_limit_kw: f64,
    source: SoftLimitSource,
    hourly_budget_exhausted: bool,
    limit_reason: LimitReason,
}

fn compute_dynamic_soft_limit(input: &PlanBuilderInput) -> DynamicSoftLimit {
    let capacity_soft_limit = input.guard.capacity_soft_limit_kw;

    if let Some(daily_limit) = input.daily_budget.soft_limit_kw {
        if daily_limit < capacity_soft_limit {
            let both = input.current_hour_used_kwh >= input.current_hour_budget_kwh;
            return DynamicSoftLimit {
                soft_limit_kw: daily_limit,
                source: if both { SoftLimitSource::Both } else { SoftLimitSource::Daily },
                hourly_budget_exhausted: both,
                limit_reason: if both { LimitReason::Both } else { LimitReason::Daily },
            };
        }
    }

    if input.current_hour_budget_kwh > 0.0 && input.current_hour_used_kwh >= input.current_hour_budget_kwh {
        let minutes_left = input.minutes_remaining.max(1.0);
        let remaining_kwh = (input.current_hour_budget_kwh - input.current_hour_used_kwh).max(0.0);
        let tightened = (remaining_kwh * 60.0 / minutes_left).min(capacity_soft_limit);
        return DynamicSoftLimit {
            soft_limit_kw: tightened,
            source: SoftLimitSource::Capacity,
            hourly_budget_exhausted: true,
            limit_reason: LimitReason::Hourly,
        };
    }

    DynamicSoftLimit {
        soft_limit_kw: capacity_soft_limit,
        source: SoftLimitSource::Capacity,
        hourly_budget_exhausted: false,
        limit_reason: LimitReason::None,
    }
}

/// Always the contract limit, never the dynamic soft limit (§4.4).
pub fn compute_shortfall_threshold(contract_limit_kw: f64) -> f64 {
    contract_limit_kw
}

/// Round-half-to-even to 0.5 degree steps, clamped after quantisation
/// (§4.4.1).
pub fn quantize_temperature(celsius: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let steps = celsius / 0.5;
    let quantized = round_half_even(steps) * 0.5;
    let lo = min.unwrap_or(-50.0).max(-50.0);
    let hi = max.unwrap_or(50.0).min(50.0);
    quantized.clamp(lo, hi)
}

fn round_half_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if (diff - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

struct Candidate {
    id: String,
    priority: i32,
    contribution_kw: f64,
}

/// Build one `DevicePlan` from the current snapshot and prior engine state.
/// Mutates `state` in place with this cycle's hysteresis bookkeeping.
pub fn build_plan(input: PlanBuilderInput, state: &mut PlanEngineState) -> DevicePlan {
    let now_ms = input.now.timestamp_millis();
    state.expire_stale_swaps(now_ms, SWAP_SETTLE_MS);

    let total_kw = input.guard.total_kw.unwrap_or(0.0);
    let dynamic = compute_dynamic_soft_limit(&input);
    let headroom_raw = dynamic.soft_limit_kw - total_kw;

    // Phase B: order candidates highest-priority-kept, lowest-priority-shed-first.
    let mut candidates: Vec<Candidate> = input
        .devices
        .iter()
        .filter(|d| d.controllable && d.managed)
        .map(|d| Candidate {
            id: d.id.clone(),
            priority: input.mode_config.priority(input.mode, &d.id),
            contribution_kw: d.expected_power_kw.max(0.0),
        })
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    let hysteresis = if input.guard.shedding_active {
        input.guard.restore_margin_kw
    } else {
        0.0
    };
    let shed_target = (-headroom_raw).max(0.0) + hysteresis;

    let mut shed_set: HashMap<String, String> = HashMap::new();
    let mut accumulated = 0.0;
    for c in &candidates {
        if accumulated >= shed_target {
            break;
        }
        shed_set.insert(c.id.clone(), String::new());
        accumulated += c.contribution_kw;
    }

    // A genuine shortfall is "ran out of candidates before reaching target",
    // not merely "shed target is positive" — ordinary overshoot with
    // keep-candidates remaining gets the plain capacity reason instead.
    let exhausted_without_reaching_target = !candidates.is_empty() && accumulated < shed_target;
    let phase_b_reason = if exhausted_without_reaching_target {
        format!("shortfall (need {:.2} kW, headroom {:.2} kW)", shed_target, -headroom_raw)
    } else if matches!(dynamic.source, SoftLimitSource::Daily | SoftLimitSource::Both) {
        "daily budget exceeded".to_string()
    } else if dynamic.hourly_budget_exhausted {
        "hourly budget exhausted".to_string()
    } else {
        "shed due to capacity".to_string()
    };
    for reason in shed_set.values_mut() {
        *reason = phase_b_reason.clone();
    }

    let device_by_id: HashMap<&str, &DeviceSnapshot> = input.devices.iter().map(|d| (d.id.as_str(), d)).collect();

    // Phase C: initial per-device plan.
    let mut rows: Vec<DevicePlanRow> = Vec::with_capacity(input.devices.len());
    for d in input.devices {
        let priority = input.mode_config.priority(input.mode, &d.id);
        let current_state = match d.current_on {
            Some(true) => CurrentState::On,
            Some(false) => CurrentState::Off,
            None => {
                if d.capabilities.has_onoff {
                    CurrentState::Unknown
                } else {
                    CurrentState::NotApplicable
                }
            }
        };

        if !d.controllable || !d.managed {
            rows.push(DevicePlanRow {
                id: d.id.clone(),
                name: d.name.clone(),
                priority,
                current_state,
                current_target: d.current_target,
                planned_state: PlannedState::Keep,
                planned_target: d.current_target,
                shed_action: None,
                shed_temperature: None,
                reason: "not controllable".to_string(),
                power_kw: d.expected_power_kw,
                expected_power_kw: d.expected_power_kw,
                measured_power_kw: d.measured_power_kw,
                controllable: d.controllable,
                managed: d.managed,
            });
            continue;
        }

        let mode_target = input
            .mode_config
            .target_temperature(input.mode, &d.id)
            .or(d.current_target);

        if let Some(reason) = shed_set.get(&d.id) {
            let behavior = input.shed_behaviors.get(&d.id).copied().unwrap_or_default();
            let shed_temperature = match behavior {
                ShedBehavior::SetTemperature { temperature } => Some(quantize_temperature(
                    temperature,
                    d.capabilities.min_temperature,
                    d.capabilities.max_temperature,
                )),
                ShedBehavior::TurnOff => None,
            };
            rows.push(DevicePlanRow {
                id: d.id.clone(),
                name: d.name.clone(),
                priority,
                current_state,
                current_target: d.current_target,
                planned_state: PlannedState::Shed,
                planned_target: shed_temperature.or(d.current_target),
                shed_action: Some(behavior),
                shed_temperature,
                reason: reason.clone(),
                power_kw: d.expected_power_kw,
                expected_power_kw: d.expected_power_kw,
                measured_power_kw: d.measured_power_kw,
                controllable: d.controllable,
                managed: d.managed,
            });
            continue;
        }

        let planned_target = apply_price_shaping(
            mode_target,
            input.price_level,
            input.price_optimization,
            d.capabilities.min_temperature,
            d.capabilities.max_temperature,
        );

        rows.push(DevicePlanRow {
            id: d.id.clone(),
            name: d.name.clone(),
            priority,
            current_state,
            current_target: d.current_target,
            planned_state: PlannedState::Keep,
            planned_target,
            shed_action: None,
            shed_temperature: None,
            reason: String::new(),
            power_kw: d.expected_power_kw,
            expected_power_kw: d.expected_power_kw,
            measured_power_kw: d.measured_power_kw,
            controllable: d.controllable,
            managed: d.managed,
        });
    }

    // Phase D: restore planning — at most one restore per cycle, plus at
    // most one paired swap.
    let mut headroom = dynamic.soft_limit_kw - total_kw;
    let mut restored_one = false;
    let shed_ids_by_priority: Vec<String> = {
        let mut ids: Vec<&DevicePlanRow> = rows.iter().filter(|r| r.planned_state == PlannedState::Shed).collect();
        ids.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        ids.into_iter().map(|r| r.id.clone()).collect()
    };

    for candidate_id in &shed_ids_by_priority {
        let Some(device) = device_by_id.get(candidate_id.as_str()) else { continue };
        let restore_buffer = device.expected_power_kw.max(0.0) + RESTORE_MARGIN_KW;
        let last_restore = state.last_device_restore_ms.get(candidate_id).copied().unwrap_or(0);
        let cooldown_elapsed = now_ms - last_restore >= RESTORE_COOLDOWN.as_millis() as i64;
        let pending_swap = state.pending_swap_timestamps.contains_key(candidate_id);
        let restore_eligible = headroom >= restore_buffer && cooldown_elapsed && !pending_swap;

        if restored_one {
            if restore_eligible {
                if let Some(row) = rows.iter_mut().find(|r| &r.id == candidate_id) {
                    row.reason = "restore throttled".to_string();
                }
            }
            continue;
        }

        if restore_eligible {
            if let Some(row) = rows.iter_mut().find(|r| &r.id == candidate_id) {
                let mode_target = input.mode_config.target_temperature(input.mode, candidate_id).or(row.current_target);
                row.planned_state = PlannedState::Keep;
                row.planned_target = apply_price_shaping(
                    mode_target,
                    input.price_level,
                    input.price_optimization,
                    device.capabilities.min_temperature,
                    device.capabilities.max_temperature,
                );
                row.shed_action = None;
                row.shed_temperature = None;
                row.reason = String::new();
            }
            headroom -= restore_buffer;
            restored_one = true;
            state.last_device_restore_ms.insert(candidate_id.clone(), now_ms);
            continue;
        }

        // Swap attempt: restore fails purely on headroom, and a lower
        // priority currently-keep device exists to shed in its place.
        if !cooldown_elapsed || pending_swap {
            continue;
        }
        let lower_priority_keep = {
            let this_priority = input.mode_config.priority(input.mode, candidate_id);
            rows.iter()
                .filter(|r| r.planned_state == PlannedState::Keep && r.controllable && r.managed)
                .filter(|r| r.priority > this_priority)
                .min_by(|a, b| a.priority.cmp(&b.priority))
                .map(|r| r.id.clone())
        };
        if let Some(peer_id) = lower_priority_keep {
            state.pending_swap_timestamps.insert(candidate_id.clone(), now_ms);
            state.swapped_out_for.insert(candidate_id.clone(), peer_id.clone());
            if let Some(peer_row) = rows.iter_mut().find(|r| r.id == peer_id) {
                peer_row.planned_state = PlannedState::Shed;
                peer_row.reason = format!("swapped out for {candidate_id}");
            }
            if let Some(row) = rows.iter_mut().find(|r| &r.id == candidate_id) {
                row.reason = "swap pending".to_string();
            }
        }
    }

    // Phase E: shed-temperature hold — devices already held at shed
    // temperature stay annotated as such even once acute overshoot clears.
    // (Phase B/D already stamp every shed row with a concrete reason, so
    // there's nothing left empty to normalise here — just the cooldown
    // annotation below.)
    for row in rows.iter_mut() {
        if row.planned_state == PlannedState::Shed {
            let last_shed = state.last_device_shed_ms.get(&row.id).copied().unwrap_or(0);
            if now_ms - last_shed < RESTORE_COOLDOWN.as_millis() as i64 && last_shed > 0 {
                let remaining_s = (RESTORE_COOLDOWN.as_millis() as i64 - (now_ms - last_shed)).max(0) / 1000;
                row.reason = format!("cooldown (shedding, {remaining_s}s remaining)");
            }
        }
    }

    // Phase F: finalise.
    rows.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    state.last_planned_shed_ids = rows
        .iter()
        .filter(|r| r.planned_state == PlannedState::Shed)
        .map(|r| r.id.clone())
        .collect();
    state.hourly_budget_exhausted = dynamic.hourly_budget_exhausted;

    let meta = PlanMeta {
        total_kw: input.guard.total_kw,
        soft_limit_kw: dynamic.soft_limit_kw,
        capacity_soft_limit_kw: input.guard.capacity_soft_limit_kw,
        daily_soft_limit_kw: input.daily_budget.soft_limit_kw,
        soft_limit_source: dynamic.source,
        headroom_kw: input.guard.total_kw.map(|_| dynamic.soft_limit_kw - total_kw),
        used_kwh: input.current_hour_used_kwh,
        budget_kwh: input.current_hour_budget_kwh,
        daily_budget_hour_kwh: if input.daily_budget.enabled {
            Some(input.daily_budget.hourly_allowance_kwh)
        } else {
            None
        },
        hourly_budget_exhausted: dynamic.hourly_budget_exhausted,
        controlled_kw: input.controlled_kw,
        uncontrolled_kw: input.uncontrolled_kw,
        minutes_remaining: input.minutes_remaining,
        daily_budget_remaining_kwh: if input.daily_budget.enabled {
            Some(input.daily_budget.daily_remaining_kwh)
        } else {
            None
        },
        daily_budget_exceeded: if input.daily_budget.enabled {
            Some(input.daily_budget.exceeded)
        } else {
            None
        },
        limit_reason: dynamic.limit_reason,
    };

    DevicePlan { meta, devices: rows }
}

fn apply_price_shaping(
    target: Option<f64>,
    level: PriceLevel,
    cfg: PriceOptimizationConfig,
    min: Option<f64>,
    max: Option<f64>,
) -> Option<f64> {
    let target = target?;
    if !cfg.enabled {
        return Some(target);
    }
    let shaped = match level {
        PriceLevel::Cheap => target + cfg.cheap_delta,
        PriceLevel::Expensive => target + cfg.expensive_delta,
        PriceLevel::Normal | PriceLevel::Unknown => target,
    };
    let lo = min.unwrap_or(-50.0);
    let hi = max.unwrap_or(50.0);
    Some(shaped.clamp(lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn device(id: &str, expected_kw: f64) -> DeviceSnapshot {
        let mut d = DeviceSnapshot::new(id, id, Utc::now());
        d.expected_power_kw = expected_kw;
        d.current_on = Some(true);
        d
    }

    fn base_input<'a>(
        devices: &'a [DeviceSnapshot],
        mode_config: &'a ModeConfig,
        shed_behaviors: &'a HashMap<String, ShedBehavior>,
        total_kw: f64,
        capacity_soft_limit_kw: f64,
    ) -> PlanBuilderInput<'a> {
        PlanBuilderInput {
            devices,
            mode: "Home",
            mode_config,
            shed_behaviors,
            guard: GuardSnapshot {
                total_kw: Some(total_kw),
                capacity_soft_limit_kw,
                restore_margin_kw: RESTORE_MARGIN_KW,
                shedding_active: false,
            },
            daily_budget: DailyBudgetSnapshot::disabled(),
            price_level: PriceLevel::Unknown,
            price_optimization: PriceOptimizationConfig::default(),
            current_hour_used_kwh: 0.0,
            current_hour_budget_kwh: 100.0,
            controlled_kw: total_kw,
            uncontrolled_kw: 0.0,
            minutes_remaining: 30.0,
            now: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn sheds_lowest_priority_first_when_over_soft_limit() {
        let devices = vec![device("high", 2.0), device("low", 3.0)];
        let mut mode_config = ModeConfig::default();
        mode_config.capacity_priorities.insert(
            "Home".to_string(),
            [("high".to_string(), 1), ("low".to_string(), 10)].into_iter().collect(),
        );
        let behaviors = HashMap::new();
        let input = base_input(&devices, &mode_config, &behaviors, 9.0, 8.0);
        let mut state = PlanEngineState::new();
        let plan = build_plan(input, &mut state);

        let low_row = plan.devices.iter().find(|r| r.id == "low").unwrap();
        assert_eq!(low_row.planned_state, PlannedState::Shed);
        let high_row = plan.devices.iter().find(|r| r.id == "high").unwrap();
        assert_eq!(high_row.planned_state, PlannedState::Keep);
    }

    #[test]
    fn quantizes_shed_temperature_to_half_degree_steps() {
        assert_eq!(quantize_temperature(21.24, None, None), 21.0);
        assert_eq!(quantize_temperature(21.26, None, None), 21.5);
        assert_eq!(quantize_temperature(21.25, None, None), 21.0); // ties to even
    }

    #[test]
    fn non_controllable_devices_are_always_kept() {
        let mut d = device("fixed", 5.0);
        d.controllable = false;
        let devices = vec![d];
        let mode_config = ModeConfig::default();
        let behaviors = HashMap::new();
        let input = base_input(&devices, &mode_config, &behaviors, 9.0, 8.0);
        let mut state = PlanEngineState::new();
        let plan = build_plan(input, &mut state);
        assert_eq!(plan.devices[0].planned_state, PlannedState::Keep);
        assert_eq!(plan.devices[0].reason, "not controllable");
    }

    #[test]
    fn restores_when_headroom_allows() {
        let devices = vec![device("a", 1.0)];
        let mode_config = ModeConfig::default();
        let behaviors = HashMap::new();
        // Plenty of headroom -> nothing shed, device stays kept.
        let input = base_input(&devices, &mode_config, &behaviors, 2.0, 8.0);
        let mut state = PlanEngineState::new();
        let plan = build_plan(input, &mut state);
        assert_eq!(plan.devices[0].planned_state, PlannedState::Keep);
    }
}
