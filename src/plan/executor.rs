use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::capacity::CapacityGuard;
use crate::domain::mode::ShedBehavior;
use crate::domain::plan::{CurrentState, DevicePlan, PlannedState};
use crate::error::CoreError;
use crate::sdk::DeviceSdk;

use super::state::PlanEngineState;

/// Per-call budget for an individual SDK action; a timed-out call degrades
/// only the device it targeted (§4.5, §7 SdkTransient).
pub const SDK_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One per-device async mutex, held for the duration of that device's SDK
/// call so two overlapping rebuilds never race the same actuator.
pub type DeviceLocks = HashMap<String, Arc<AsyncMutex<()>>>;

pub fn device_locks_for(plan: &DevicePlan, existing: &mut DeviceLocks) {
    for row in &plan.devices {
        existing.entry(row.id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(())));
    }
}

/// Returns whether the device's actual state transitioned this cycle (§4.5:
/// only a genuine `turn_off` on-transition stamps `lastDeviceShedMs`, only a
/// genuine restore action stamps `lastDeviceRestoreMs` — a no-op cycle where
/// the device already sat in its planned state stamps neither).
async fn apply_one(
    sdk: &dyn DeviceSdk,
    row: &crate::domain::plan::DevicePlanRow,
    dry_run: bool,
    lock: Arc<AsyncMutex<()>>,
) -> Result<bool, CoreError> {
    let _guard = lock.lock().await;

    match row.planned_state {
        PlannedState::Shed => match row.shed_action {
            Some(ShedBehavior::TurnOff) if row.current_state == CurrentState::On => {
                if dry_run {
                    info!(device = %row.id, "dry-run: would turn off");
                    return Ok(true);
                }
                call_with_timeout(sdk.set_onoff(&row.id, false))
                    .await
                    .map(|()| true)
                    .map_err(|e| CoreError::sdk_transient(&row.id, e))
            }
            Some(ShedBehavior::SetTemperature { .. }) => {
                let Some(target) = row.shed_temperature else { return Ok(false) };
                if dry_run {
                    info!(device = %row.id, target, "dry-run: would set shed temperature");
                    return Ok(false);
                }
                call_with_timeout(sdk.set_target_temperature(&row.id, target))
                    .await
                    .map(|()| false)
                    .map_err(|e| CoreError::sdk_transient(&row.id, e))
            }
            _ => Ok(false),
        },
        PlannedState::Keep => {
            let mut actions = Vec::new();
            if row.current_state == CurrentState::Off {
                actions.push("onoff");
                if !dry_run {
                    call_with_timeout(sdk.set_onoff(&row.id, true))
                        .await
                        .map_err(|e| CoreError::sdk_transient(&row.id, e))?;
                }
            }
            if let Some(target) = row.planned_target {
                if row.current_target != Some(target) {
                    actions.push("target_temperature");
                    if !dry_run {
                        call_with_timeout(sdk.set_target_temperature(&row.id, target))
                            .await
                            .map_err(|e| CoreError::sdk_transient(&row.id, e))?;
                    }
                }
            }
            if dry_run && !actions.is_empty() {
                info!(device = %row.id, ?actions, "dry-run: would restore");
            }
            Ok(!actions.is_empty())
        }
    }
}

async fn call_with_timeout<F>(fut: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(SDK_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("sdk call timed out after {:?}", SDK_CALL_TIMEOUT)),
    }
}

/// Apply a `DevicePlan` to the platform, then update Guard shedding/
/// shortfall latches from the outcome (§4.5).
pub async fn execute_plan(
    plan: &DevicePlan,
    sdk: &dyn DeviceSdk,
    dry_run: bool,
    locks: &DeviceLocks,
    guard: &mut CapacityGuard,
    state: &mut PlanEngineState,
    now_ms: i64,
) {
    let futures = plan.devices.iter().map(|row| {
        let lock = locks
            .get(&row.id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AsyncMutex::new(())));
        async move { (row.id.clone(), apply_one(sdk, row, dry_run, lock).await) }
    });

    let results = join_all(futures).await;

    let mut any_failed = false;
    for (id, result) in results {
        match result {
            Ok(transitioned) => {
                if transitioned {
                    let row = plan.devices.iter().find(|r| r.id == id);
                    match row.map(|r| r.planned_state) {
                        Some(PlannedState::Shed) => {
                            state.last_device_shed_ms.insert(id, now_ms);
                        }
                        Some(PlannedState::Keep) => {
                            state.last_device_restore_ms.insert(id, now_ms);
                        }
                        None => {}
                    }
                }
            }
            Err(e) => {
                any_failed = true;
                warn!(device = %id, error = %e, "device action failed, marking unavailable");
                sdk.mark_unavailable(&id).await;
            }
        }
    }
    let _ = any_failed;

    let shed_count = plan.devices.iter().filter(|r| r.planned_state == PlannedState::Shed).count();
    guard.set_shedding_active(shed_count > 0);

    let has_controllable_keep_remaining = plan
        .devices
        .iter()
        .any(|r| r.planned_state == PlannedState::Keep && r.controllable && r.managed);
    let deficit = plan.meta.headroom_kw.map(|h| (-h).max(0.0)).unwrap_or(0.0);
    guard.check_shortfall(has_controllable_keep_remaining, deficit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::{DevicePlanRow, PlanMeta};
    use crate::domain::budget::SoftLimitSource;
    use crate::sdk::simulated::InMemoryDeviceSdk;
    use crate::sdk::DeviceTelemetry;

    fn telemetry(id: &str) -> DeviceTelemetry {
        DeviceTelemetry {
            id: id.to_string(),
            name: id.to_string(),
            zone: None,
            available: true,
            has_onoff: true,
            has_target_temperature: false,
            has_measure_power: true,
            min_temperature: None,
            max_temperature: None,
            current_on: Some(true),
            current_temperature: None,
            current_target: None,
            measured_power_kw: Some(2.0),
            load_setting_kw: None,
            energy_value_on_kw: None,
            energy_value_off_kw: None,
            approximation_kw: None,
            energy_w: None,
        }
    }

    fn row(id: &str, planned: PlannedState) -> DevicePlanRow {
        DevicePlanRow {
            id: id.to_string(),
            name: id.to_string(),
            priority: 1,
            current_state: CurrentState::On,
            current_target: None,
            planned_state: planned,
            planned_target: None,
            shed_action: Some(ShedBehavior::TurnOff),
            shed_temperature: None,
            reason: String::new(),
            power_kw: 2.0,
            expected_power_kw: 2.0,
            measured_power_kw: Some(2.0),
            controllable: true,
            managed: true,
        }
    }

    fn meta() -> PlanMeta {
        PlanMeta {
            total_kw: Some(8.0),
            soft_limit_kw: 8.0,
            capacity_soft_limit_kw: 8.0,
            daily_soft_limit_kw: None,
            soft_limit_source: SoftLimitSource::Capacity,
            headroom_kw: Some(0.0),
            used_kwh: 0.0,
            budget_kwh: 0.0,
            daily_budget_hour_kwh: None,
            hourly_budget_exhausted: false,
            controlled_kw: 8.0,
            uncontrolled_kw: 0.0,
            minutes_remaining: 30.0,
            daily_budget_remaining_kwh: None,
            daily_budget_exceeded: None,
            limit_reason: crate::domain::plan::LimitReason::None,
        }
    }

    #[tokio::test]
    async fn shed_device_is_turned_off() {
        let sdk = InMemoryDeviceSdk::new().with_device(telemetry("d1"), 2.0);
        let plan = DevicePlan {
            meta: meta(),
            devices: vec![row("d1", PlannedState::Shed)],
        };
        let mut guard = CapacityGuard::new(10.0, 0.2, 0.3);
        let mut state = PlanEngineState::new();
        let locks = DeviceLocks::new();

        execute_plan(&plan, &sdk, false, &locks, &mut guard, &mut state, 1_000).await;

        let devices = sdk.list_devices().await.unwrap();
        assert_eq!(devices[0].current_on, Some(false));
        assert!(guard.shedding_active());
        assert_eq!(state.last_device_shed_ms.get("d1"), Some(&1_000));
    }

    #[tokio::test]
    async fn dry_run_never_calls_sdk() {
        let sdk = InMemoryDeviceSdk::new().with_device(telemetry("d1"), 2.0);
        let plan = DevicePlan {
            meta: meta(),
            devices: vec![row("d1", PlannedState::Shed)],
        };
        let mut guard = CapacityGuard::new(10.0, 0.2, 0.3);
        let mut state = PlanEngineState::new();
        let locks = DeviceLocks::new();

        execute_plan(&plan, &sdk, true, &locks, &mut guard, &mut state, 1_000).await;

        let devices = sdk.list_devices().await.unwrap();
        assert_eq!(devices[0].current_on, Some(true)); // unchanged
        assert!(guard.shedding_active()); // guard still updated
    }
}
