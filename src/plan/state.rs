use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Persisted hysteresis state carried from one Plan Builder cycle to the
/// next (§4.4, §9). Re-hydrated from and written back into the settings
/// store alongside `device_plan_snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEngineState {
    /// deviceId -> epoch ms of the last time it was shed.
    pub last_device_shed_ms: HashMap<String, i64>,
    /// deviceId -> epoch ms of the last time it was restored.
    pub last_device_restore_ms: HashMap<String, i64>,
    pub last_shedding_ms: Option<i64>,
    pub last_overshoot_ms: Option<i64>,
    pub last_restore_ms: Option<i64>,
    pub last_planned_shed_ids: HashSet<String>,
    /// deviceId -> epoch ms a restore-triggered swap was proposed.
    pub pending_swap_timestamps: HashMap<String, i64>,
    /// deviceId (restored) -> deviceId (shed in its place).
    pub swapped_out_for: HashMap<String, String>,
    pub hourly_budget_exhausted: bool,
    pub in_shortfall: bool,
}

impl PlanEngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop swap proposals older than `SWAP_SETTLE_MS` so an unobserved swap
    /// does not block future shedding decisions forever (§4.4 Phase D).
    pub fn expire_stale_swaps(&mut self, now_ms: i64, settle_ms: i64) {
        self.pending_swap_timestamps.retain(|_, ts| now_ms - *ts < settle_ms);
    }
}
