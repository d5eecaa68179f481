use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::plan::{DevicePlan, DevicePlanRow, PlanMeta};
use crate::flow::{cards, FlowRegistry};
use crate::settings::{keys, SettingsStore};

pub const DETAIL_SNAPSHOT_THROTTLE: Duration = Duration::from_millis(30_000);
pub const VOLATILE_WRITE_THROTTLE: Duration = Duration::from_millis(15_000);

/// A rebuild request placed on the single-writer FIFO queue (§4.6).
#[derive(Debug, Clone)]
pub struct RebuildRequest {
    pub reason: String,
}

/// Atomics-backed counters exposed at `/api/v1/status` (§4.6).
#[derive(Debug, Default)]
pub struct RebuildStats {
    pub queue_depth: AtomicU64,
    pub total_enqueued: AtomicU64,
    pub total_completed: AtomicU64,
    pub last_wait_ms: AtomicU64,
    reasons: Mutex<std::collections::HashMap<String, u64>>,
}

impl RebuildStats {
    pub fn record_enqueue(&self, reason: &str) {
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        *self.reasons.lock().entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_complete(&self, wait: Duration) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        self.last_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn reason_counts(&self) -> std::collections::HashMap<String, u64> {
        self.reasons.lock().clone()
    }
}

/// Handle used by callers (tick loop, hourly loop, settings listener, Flow
/// actions) to enqueue a rebuild without blocking on the result.
#[derive(Clone)]
pub struct RebuildQueue {
    sender: mpsc::UnboundedSender<RebuildRequest>,
}

impl RebuildQueue {
    pub fn enqueue(&self, reason: impl Into<String>) {
        let _ = self.sender.send(RebuildRequest { reason: reason.into() });
    }
}

fn signature_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn round_step(value: f64, step: f64) -> i64 {
    (value / step).round() as i64
}

fn action_signature(plan: &DevicePlan) -> u64 {
    let rows: Vec<String> = plan
        .devices
        .iter()
        .map(|d| {
            format!(
                "{}|{}|{}|{:?}|{}",
                d.id,
                planned_state_str(d),
                d.planned_target.map(|t| round_step(t, 0.01)).unwrap_or(i64::MIN),
                d.shed_action.as_ref().map(shed_action_str),
                d.controllable,
            )
        })
        .collect();
    signature_of(&rows)
}

fn detail_signature(plan: &DevicePlan) -> u64 {
    let rows: Vec<String> = plan
        .devices
        .iter()
        .map(|d| {
            format!(
                "{}|{}|{}|{}|{}|{}",
                d.id,
                d.priority,
                current_state_str(d),
                d.current_target.map(|t| round_step(t, 0.01)).unwrap_or(i64::MIN),
                d.reason,
                planned_state_str(d),
            )
        })
        .collect();
    signature_of(&rows)
}

fn rounded_meta(meta: &PlanMeta) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        meta.total_kw.map(|v| round_step(v, 0.1)).unwrap_or(i64::MIN),
        round_step(meta.soft_limit_kw, 0.1),
        meta.headroom_kw.map(|v| round_step(v, 0.1)).unwrap_or(i64::MIN),
        round_step(meta.used_kwh, 0.01),
        round_step(meta.budget_kwh, 0.01),
        meta.minutes_remaining.floor().max(0.0) as i64,
    )
}

fn meta_signature(plan: &DevicePlan) -> u64 {
    signature_of(&rounded_meta(&plan.meta))
}

fn planned_state_str(row: &DevicePlanRow) -> &'static str {
    match row.planned_state {
        crate::domain::plan::PlannedState::Keep => "keep",
        crate::domain::plan::PlannedState::Shed => "shed",
    }
}

fn current_state_str(row: &DevicePlanRow) -> &'static str {
    match row.current_state {
        crate::domain::plan::CurrentState::On => "on",
        crate::domain::plan::CurrentState::Off => "off",
        crate::domain::plan::CurrentState::Unknown => "unknown",
        crate::domain::plan::CurrentState::NotApplicable => "na",
    }
}

fn shed_action_str(behavior: &crate::domain::mode::ShedBehavior) -> &'static str {
    match behavior {
        crate::domain::mode::ShedBehavior::TurnOff => "turn_off",
        crate::domain::mode::ShedBehavior::SetTemperature { .. } => "set_temperature",
    }
}

/// UI summary subset of a `DevicePlan`, persisted under `pels_status` (§4.6).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PelsStatus {
    pub soft_limit_kw: f64,
    pub headroom_kw: Option<f64>,
    pub shed_count: usize,
    pub limit_reason: crate::domain::plan::LimitReason,
    pub price_level: crate::domain::price::PriceLevel,
}

struct Signatures {
    action: u64,
    detail: u64,
    meta: u64,
}

/// Owns the diff/throttle/persist decisions for one plan cycle (§4.6).
/// Instantiate once per running controller; `on_new_plan` is called after
/// every successful rebuild, in FIFO order.
pub struct PlanService {
    settings: std::sync::Arc<dyn SettingsStore>,
    flow: std::sync::Arc<dyn FlowRegistry>,
    last: Mutex<Option<Signatures>>,
    last_detail_write: Mutex<Option<Instant>>,
    last_pels_write: Mutex<Option<Instant>>,
    last_price_level: Mutex<Option<crate::domain::price::PriceLevel>>,
    pub stats: RebuildStats,
}

impl PlanService {
    pub fn new(settings: std::sync::Arc<dyn SettingsStore>, flow: std::sync::Arc<dyn FlowRegistry>) -> Self {
        Self {
            settings,
            flow,
            last: Mutex::new(None),
            last_detail_write: Mutex::new(None),
            last_pels_write: Mutex::new(None),
            last_price_level: Mutex::new(None),
            stats: RebuildStats::default(),
        }
    }

    pub fn make_queue(&self) -> (RebuildQueue, mpsc::UnboundedReceiver<RebuildRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RebuildQueue { sender: tx }, rx)
    }

    /// Persist and emit side effects for a freshly built plan. Never panics;
    /// a persistence failure is logged and does not block the next rebuild.
    pub async fn on_new_plan(&self, plan: &DevicePlan, price_level: crate::domain::price::PriceLevel) {
        let action = action_signature(plan);
        let detail = detail_signature(plan);
        let meta = meta_signature(plan);

        let mut last = self.last.lock();
        let changed_action_or_detail = match last.as_ref() {
            Some(prev) => prev.action != action || prev.detail != detail,
            None => true,
        };
        let changed_meta_only = !changed_action_or_detail
            && last.as_ref().map(|p| p.meta != meta).unwrap_or(true);
        *last = Some(Signatures { action, detail, meta });
        drop(last);

        let should_write_snapshot = changed_action_or_detail || {
            let mut gate = self.last_detail_write.lock();
            let now = Instant::now();
            let due = gate.map(|t| now.duration_since(t) >= DETAIL_SNAPSHOT_THROTTLE).unwrap_or(true);
            if due && changed_meta_only {
                *gate = Some(now);
            }
            due && changed_meta_only
        };

        if should_write_snapshot {
            if let Ok(value) = serde_json::to_value(plan) {
                if let Err(e) = self.settings.set(keys::DEVICE_PLAN_SNAPSHOT, value).await {
                    warn!(error = %e, "failed to persist device_plan_snapshot");
                }
            }
            if changed_action_or_detail {
                let _ = self
                    .flow
                    .trigger(cards::PLAN_UPDATED, serde_json::json!({}), serde_json::to_value(plan).unwrap_or_default())
                    .await;
            }
        }

        let pels = PelsStatus {
            soft_limit_kw: plan.meta.soft_limit_kw,
            headroom_kw: plan.meta.headroom_kw,
            shed_count: plan.shed_ids().len(),
            limit_reason: plan.meta.limit_reason,
            price_level,
        };
        let write_pels = changed_action_or_detail || {
            let mut gate = self.last_pels_write.lock();
            let now = Instant::now();
            let due = gate.map(|t| now.duration_since(t) >= VOLATILE_WRITE_THROTTLE).unwrap_or(true);
            if due {
                *gate = Some(now);
            }
            due
        };
        if write_pels {
            if let Ok(value) = serde_json::to_value(&pels) {
                if let Err(e) = self.settings.set(keys::PELS_STATUS, value).await {
                    warn!(error = %e, "failed to persist pels_status");
                }
            }
        }

        let mut last_level = self.last_price_level.lock();
        if *last_level != Some(price_level) {
            *last_level = Some(price_level);
            drop(last_level);
            info!(?price_level, "price level changed");
            let _ = self
                .flow
                .trigger(
                    cards::PRICE_LEVEL_CHANGED,
                    serde_json::json!({ "level": price_level }),
                    serde_json::json!({ "priceLevel": price_level }),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::budget::SoftLimitSource;
    use crate::domain::plan::{CurrentState, LimitReason, PlannedState};
    use crate::flow::registry::InProcessFlowRegistry;
    use crate::settings::json_file::InMemorySettingsStore;

    fn plan(shed: bool) -> DevicePlan {
        DevicePlan {
            meta: PlanMeta {
                total_kw: Some(5.0),
                soft_limit_kw: 8.0,
                capacity_soft_limit_kw: 8.0,
                daily_soft_limit_kw: None,
                soft_limit_source: SoftLimitSource::Capacity,
                headroom_kw: Some(3.0),
                used_kwh: 0.0,
                budget_kwh: 0.0,
                daily_budget_hour_kwh: None,
                hourly_budget_exhausted: false,
                controlled_kw: 5.0,
                uncontrolled_kw: 0.0,
                minutes_remaining: 30.0,
                daily_budget_remaining_kwh: None,
                daily_budget_exceeded: None,
                limit_reason: LimitReason::None,
            },
            devices: vec![DevicePlanRow {
                id: "d1".into(),
                name: "d1".into(),
                priority: 1,
                current_state: CurrentState::On,
                current_target: None,
                planned_state: if shed { PlannedState::Shed } else { PlannedState::Keep },
                planned_target: None,
                shed_action: None,
                shed_temperature: None,
                reason: String::new(),
                power_kw: 1.0,
                expected_power_kw: 1.0,
                measured_power_kw: Some(1.0),
                controllable: true,
                managed: true,
            }],
        }
    }

    #[tokio::test]
    async fn action_change_writes_snapshot_and_fires_plan_updated() {
        let settings = InMemorySettingsStore::new();
        let flow = std::sync::Arc::new(InProcessFlowRegistry::new());
        let service = PlanService::new(settings.clone(), flow.clone());

        service.on_new_plan(&plan(false), crate::domain::price::PriceLevel::Normal).await;
        service.on_new_plan(&plan(true), crate::domain::price::PriceLevel::Normal).await;

        assert!(settings.get(keys::DEVICE_PLAN_SNAPSHOT).await.unwrap().is_some());
        assert!(flow.last_fired(cards::PLAN_UPDATED).is_some());
    }

    #[tokio::test]
    async fn price_level_change_fires_exactly_on_transition() {
        let settings = InMemorySettingsStore::new();
        let flow = std::sync::Arc::new(InProcessFlowRegistry::new());
        let service = PlanService::new(settings.clone(), flow.clone());

        service.on_new_plan(&plan(false), crate::domain::price::PriceLevel::Normal).await;
        service.on_new_plan(&plan(false), crate::domain::price::PriceLevel::Normal).await;
        service.on_new_plan(&plan(false), crate::domain::price::PriceLevel::Cheap).await;

        let fired: Vec<_> = flow
            .fired_cards()
            .into_iter()
            .filter(|c| c.card_id == cards::PRICE_LEVEL_CHANGED)
            .collect();
        assert_eq!(fired.len(), 1);
    }
}
