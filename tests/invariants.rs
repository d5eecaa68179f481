use std::collections::HashMap;

use capacity_guard::domain::budget::{DailyBudgetSnapshot, SoftLimitSource};
use capacity_guard::domain::device::DeviceSnapshot;
use capacity_guard::domain::mode::{ModeConfig, ShedBehavior};
use capacity_guard::domain::plan::PlannedState;
use capacity_guard::domain::price::{PriceLevel, PriceOptimizationConfig};
use capacity_guard::plan::{build_plan, GuardSnapshot, PlanBuilderInput, PlanEngineState, RESTORE_MARGIN_KW};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

fn make_device(id: &str, power_kw: f64, managed: bool, shed_behavior: Option<ShedBehavior>) -> (DeviceSnapshot, Option<ShedBehavior>) {
    let mut d = DeviceSnapshot::new(id, id, Utc::now());
    d.expected_power_kw = power_kw.max(0.0);
    d.current_on = Some(true);
    d.managed = managed;
    d.capabilities.has_target_temperature = shed_behavior.is_some();
    d.capabilities.min_temperature = Some(-10.0);
    d.capabilities.max_temperature = Some(30.0);
    (d, shed_behavior)
}

fn run_plan(
    devices_and_behaviors: Vec<(DeviceSnapshot, Option<ShedBehavior>)>,
    total_kw: f64,
    capacity_soft_limit_kw: f64,
    daily_soft_limit_kw: Option<f64>,
) -> capacity_guard::domain::plan::DevicePlan {
    let devices: Vec<DeviceSnapshot> = devices_and_behaviors.iter().map(|(d, _)| d.clone()).collect();

    let mut mode_config = ModeConfig::default();
    let priorities: HashMap<String, i32> = devices.iter().enumerate().map(|(i, d)| (d.id.clone(), i as i32)).collect();
    mode_config.capacity_priorities.insert("Home".to_string(), priorities);

    let mut shed_behaviors = HashMap::new();
    for (d, behavior) in &devices_and_behaviors {
        if let Some(b) = behavior {
            shed_behaviors.insert(d.id.clone(), *b);
        }
    }

    let mut daily_budget = DailyBudgetSnapshot::disabled();
    if let Some(limit) = daily_soft_limit_kw {
        daily_budget.enabled = true;
        daily_budget.soft_limit_kw = Some(limit);
        daily_budget.soft_limit_source = SoftLimitSource::Daily;
    }

    let input = PlanBuilderInput {
        devices: &devices,
        mode: "Home",
        mode_config: &mode_config,
        shed_behaviors: &shed_behaviors,
        guard: GuardSnapshot {
            total_kw: Some(total_kw),
            capacity_soft_limit_kw,
            restore_margin_kw: RESTORE_MARGIN_KW,
            shedding_active: false,
        },
        daily_budget,
        price_level: PriceLevel::Unknown,
        price_optimization: PriceOptimizationConfig::default(),
        current_hour_used_kwh: 0.0,
        current_hour_budget_kwh: 1_000.0,
        controlled_kw: total_kw,
        uncontrolled_kw: 0.0,
        minutes_remaining: 30.0,
        now: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
    };

    let mut state = PlanEngineState::new();
    build_plan(input, &mut state)
}

fn device_strategy() -> impl Strategy<Value = (f64, bool, bool)> {
    (0.0f64..8.0, any::<bool>(), any::<bool>())
}

proptest! {
    /// Invariant 1: a `managed == false` device never appears shed.
    #[test]
    fn unmanaged_devices_are_never_shed(
        devices in prop::collection::vec(device_strategy(), 1..6),
        total_kw in 0.0f64..40.0,
        soft_limit in 0.0f64..20.0,
    ) {
        let built: Vec<_> = devices
            .iter()
            .enumerate()
            .map(|(i, (kw, managed, set_temp))| {
                let behavior = if *set_temp { Some(ShedBehavior::SetTemperature { temperature: 20.0 }) } else { Some(ShedBehavior::TurnOff) };
                make_device(&format!("d{i}"), *kw, *managed, behavior)
            })
            .collect();

        let plan = run_plan(built, total_kw, soft_limit, None);

        for row in &plan.devices {
            if !row.managed {
                prop_assert_eq!(row.planned_state, PlannedState::Keep);
            }
        }
    }

    /// Invariant 3: a shed `set_temperature` device always has
    /// `plannedTarget == shedTemperature`, clamped to [-50, 50] and a
    /// multiple of 0.5 (quantised).
    #[test]
    fn shed_temperature_is_quantised_and_clamped(
        devices in prop::collection::vec(device_strategy(), 1..6),
        total_kw in 10.0f64..40.0,
        soft_limit in 0.0f64..5.0,
    ) {
        let built: Vec<_> = devices
            .iter()
            .enumerate()
            .map(|(i, (kw, _managed, _set_temp))| {
                make_device(&format!("d{i}"), *kw, true, Some(ShedBehavior::SetTemperature { temperature: 18.0 }))
            })
            .collect();

        let plan = run_plan(built, total_kw, soft_limit, None);

        for row in &plan.devices {
            if row.planned_state == PlannedState::Shed {
                if let Some(shed_temp) = row.shed_temperature {
                    prop_assert_eq!(row.planned_target, Some(shed_temp));
                    prop_assert!(shed_temp >= -50.0 && shed_temp <= 50.0);
                    let steps = (shed_temp / 0.5).round();
                    prop_assert!((steps * 0.5 - shed_temp).abs() < 1e-9);
                }
            }
        }
    }

    /// Invariant 4: `headroomKw == softLimitKw - totalKw` whenever total
    /// power is known.
    #[test]
    fn headroom_matches_soft_limit_minus_total(
        devices in prop::collection::vec(device_strategy(), 0..6),
        total_kw in 0.0f64..40.0,
        soft_limit in 0.0f64..20.0,
    ) {
        let built: Vec<_> = devices
            .iter()
            .enumerate()
            .map(|(i, (kw, managed, _))| make_device(&format!("d{i}"), *kw, *managed, Some(ShedBehavior::TurnOff)))
            .collect();

        let plan = run_plan(built, total_kw, soft_limit, None);

        if let (Some(total), Some(headroom)) = (plan.meta.total_kw, plan.meta.headroom_kw) {
            prop_assert!((headroom - (plan.meta.soft_limit_kw - total)).abs() < 1e-6);
        }
    }

    /// Invariant 5: when the daily budget sets the soft limit, it must be
    /// at or below the capacity soft limit and become the effective limit.
    #[test]
    fn daily_soft_limit_wins_only_when_tighter(
        devices in prop::collection::vec(device_strategy(), 0..4),
        total_kw in 0.0f64..20.0,
        capacity_soft_limit in 1.0f64..20.0,
        daily_limit in 0.0f64..25.0,
    ) {
        let built: Vec<_> = devices
            .iter()
            .enumerate()
            .map(|(i, (kw, managed, _))| make_device(&format!("d{i}"), *kw, *managed, Some(ShedBehavior::TurnOff)))
            .collect();

        let plan = run_plan(built, total_kw, capacity_soft_limit, Some(daily_limit));

        let daily_or_both = matches!(plan.meta.soft_limit_source, SoftLimitSource::Daily | SoftLimitSource::Both);
        if daily_or_both {
            prop_assert!(daily_limit < capacity_soft_limit);
            prop_assert_eq!(plan.meta.daily_soft_limit_kw, Some(daily_limit));
            prop_assert_eq!(plan.meta.soft_limit_kw, daily_limit);
        } else {
            prop_assert!(daily_limit >= capacity_soft_limit);
        }
    }
}
