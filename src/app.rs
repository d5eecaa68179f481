use std::collections::HashMap;
use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{error, info, warn};

use crate::capacity::CapacityGuard;
use crate::config::AppConfig;
use crate::domain::budget::DailyBudgetSnapshot;
use crate::domain::mode::{ModeConfig, ShedBehavior};
use crate::domain::plan::DevicePlan;
use crate::domain::settings_types::CapacitySettings;
use crate::flow::FlowRegistry;
use crate::plan::{
    build_plan, device_locks_for, execute_plan, DeviceLocks, GuardSnapshot, PlanBuilderInput, PlanEngineState,
    PlanService,
};
use crate::power::{duration_until_next_hour, PowerEstimator, PowerTracker};
use crate::price_level::PriceSource;
use crate::sdk::DeviceSdk;
use crate::settings::{keys, SettingsStore};

/// Everything the rebuild path and HTTP surface share, analogous to the
/// teacher crate's `controller::AppState` (one `Arc`-wrapped shared state,
/// cloned cheaply into every spawned task and Axum handler).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sdk: Arc<dyn DeviceSdk>,
    pub settings: Arc<dyn SettingsStore>,
    pub flow: Arc<dyn FlowRegistry>,
    pub price_source: Arc<dyn PriceSource>,

    pub guard: Arc<AsyncMutex<CapacityGuard>>,
    pub tracker: Arc<AsyncMutex<PowerTracker>>,
    pub estimator: Arc<AsyncMutex<PowerEstimator>>,
    pub engine_state: Arc<AsyncMutex<PlanEngineState>>,
    pub device_locks: Arc<AsyncMutex<DeviceLocks>>,

    pub mode_config: Arc<RwLock<ModeConfig>>,
    pub current_mode: Arc<RwLock<String>>,
    pub shed_behaviors: Arc<RwLock<HashMap<String, ShedBehavior>>>,
    pub capacity_settings: Arc<RwLock<CapacitySettings>>,
    pub daily_budget: Arc<RwLock<DailyBudgetSnapshot>>,
    /// deviceId -> explicit controllable/managed override, from the
    /// `controllable_devices`/`managed_devices` settings keys (§6). Absent
    /// entries default to `true`, matching `DeviceSnapshot`'s own default.
    pub controllable_overrides: Arc<RwLock<HashMap<String, bool>>>,
    pub managed_overrides: Arc<RwLock<HashMap<String, bool>>>,

    pub plan_service: Arc<PlanService>,
    pub rebuild_queue: crate::plan::RebuildQueue,
    pub last_plan: Arc<RwLock<Option<DevicePlan>>>,

    /// One lock per settings key, so two change notifications for the same
    /// key are handled strictly one after another (§5: "settings updates...
    /// serialised through a per-key handler queue").
    pub settings_key_locks: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AppState {
    pub async fn new(
        config: AppConfig,
        sdk: Arc<dyn DeviceSdk>,
        settings: Arc<dyn SettingsStore>,
        flow: Arc<dyn FlowRegistry>,
        price_source: Arc<dyn PriceSource>,
    ) -> anyhow::Result<(Self, tokio::sync::mpsc::UnboundedReceiver<crate::plan::RebuildRequest>)> {
        let tz: Tz = config
            .controller
            .time_zone
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid IANA time zone: {}", config.controller.time_zone))?;

        let capacity_settings = read_capacity_settings(&*settings, &config).await;
        let mut guard = CapacityGuard::new(
            capacity_settings.limit_kw,
            capacity_settings.margin_kw,
            capacity_settings.restore_margin_kw,
        );
        if let Ok(Some(v)) = settings.get(keys::CAPACITY_IN_SHORTFALL).await {
            if let Some(b) = v.as_bool() {
                guard = guard.with_persisted_shortfall(b);
            }
        }

        let tracker = match settings.get(keys::POWER_TRACKER_STATE).await.ok().flatten() {
            Some(v) => match serde_json::from_value(v) {
                Ok(state) => PowerTracker::restore(tz, state),
                Err(_) => PowerTracker::new(tz),
            },
            None => PowerTracker::new(tz),
        };

        let estimator = match settings.get(keys::EXPECTED_POWER_PEAKS).await.ok().flatten() {
            Some(v) => match serde_json::from_value(v) {
                Ok(peaks) => PowerEstimator::restore(peaks),
                Err(_) => PowerEstimator::new(),
            },
            None => PowerEstimator::new(),
        };

        let mode_config = read_mode_config(&*settings).await;
        let current_mode = settings
            .get(keys::OPERATING_MODE)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| config.capacity.default_mode.clone());

        let controllable_overrides = read_bool_overrides(&*settings, keys::CONTROLLABLE_DEVICES).await;
        let managed_overrides = read_bool_overrides(&*settings, keys::MANAGED_DEVICES).await;

        let plan_service = Arc::new(PlanService::new(settings.clone(), flow.clone()));
        let (rebuild_queue, rebuild_rx) = plan_service.make_queue();

        let state = Self {
            config: Arc::new(config),
            sdk,
            settings,
            flow,
            price_source,
            guard: Arc::new(AsyncMutex::new(guard)),
            tracker: Arc::new(AsyncMutex::new(tracker)),
            estimator: Arc::new(AsyncMutex::new(estimator)),
            engine_state: Arc::new(AsyncMutex::new(PlanEngineState::new())),
            device_locks: Arc::new(AsyncMutex::new(DeviceLocks::new())),
            mode_config: Arc::new(RwLock::new(mode_config)),
            current_mode: Arc::new(RwLock::new(current_mode)),
            shed_behaviors: Arc::new(RwLock::new(HashMap::new())),
            capacity_settings: Arc::new(RwLock::new(capacity_settings)),
            daily_budget: Arc::new(RwLock::new(DailyBudgetSnapshot::disabled())),
            controllable_overrides: Arc::new(RwLock::new(controllable_overrides)),
            managed_overrides: Arc::new(RwLock::new(managed_overrides)),
            plan_service,
            rebuild_queue,
            last_plan: Arc::new(RwLock::new(None)),
            settings_key_locks: Arc::new(AsyncMutex::new(HashMap::new())),
        };

        Ok((state, rebuild_rx))
    }

    /// One full Plan Builder + Plan Executor + Plan Service cycle (§4.4-4.6).
    pub async fn rebuild(&self) {
        let now = chrono::Utc::now();
        let telemetry = match self.sdk.list_devices().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to list devices, skipping rebuild");
                return;
            }
        };

        let controllable_overrides = self.controllable_overrides.read().await.clone();
        let managed_overrides = self.managed_overrides.read().await.clone();

        let mut estimator = self.estimator.lock().await;
        let mut devices: Vec<crate::domain::device::DeviceSnapshot> = telemetry
            .iter()
            .map(|t| {
                let mut snapshot = telemetry_to_snapshot(t, now);
                snapshot.controllable = controllable_overrides.get(&t.id).copied().unwrap_or(true);
                snapshot.managed = managed_overrides.get(&t.id).copied().unwrap_or(true);
                snapshot
            })
            .collect();

        let mut total_kw = 0.0;
        let mut controlled_kw = 0.0;
        for device in devices.iter_mut() {
            let estimate = estimator.estimate(device);
            device.expected_power_kw = estimate.expected_power_kw;
            device.expected_power_source = estimate.source;
            device.load_kw = estimate.load_kw;
            total_kw += estimate.expected_power_kw;
            if device.controllable {
                controlled_kw += estimate.expected_power_kw;
            }
        }
        let peaks = estimator.snapshot();
        drop(estimator);
        let _ = self
            .settings
            .set(keys::EXPECTED_POWER_PEAKS, serde_json::to_value(peaks).unwrap_or_default())
            .await;

        let mut tracker = self.tracker.lock().await;
        tracker.record_sample(now, total_kw, controlled_kw);
        let used_kwh = tracker.current_hour_used_kwh();
        let tracker_controlled = tracker.current_hour_controlled_kwh();
        let tracker_uncontrolled = tracker.current_hour_uncontrolled_kwh();
        let minutes_remaining = tracker.minutes_remaining_in_hour(now) as f64;
        let tracker_snapshot = tracker.snapshot();
        drop(tracker);
        let _ = self
            .settings
            .set(
                keys::POWER_TRACKER_STATE,
                serde_json::to_value(tracker_snapshot).unwrap_or_default(),
            )
            .await;

        let mut guard = self.guard.lock().await;
        guard.report_total_power(total_kw);
        guard.set_shortfall_threshold_override(Some(crate::plan::compute_shortfall_threshold(guard.limit_kw())));
        let guard_snapshot = GuardSnapshot {
            total_kw: guard.main_power_kw(),
            capacity_soft_limit_kw: guard.soft_limit(),
            restore_margin_kw: guard.restore_margin_kw(),
            shedding_active: guard.shedding_active(),
        };
        drop(guard);

        let mode_config = self.mode_config.read().await.clone();
        let mode = self.current_mode.read().await.clone();
        let shed_behaviors = self.shed_behaviors.read().await.clone();
        let daily_budget = *self.daily_budget.read().await;
        let price_level = self.price_source.price_level(now);
        let capacity_settings = *self.capacity_settings.read().await;

        let input = PlanBuilderInput {
            devices: &devices,
            mode: &mode,
            mode_config: &mode_config,
            shed_behaviors: &shed_behaviors,
            guard: guard_snapshot,
            daily_budget,
            price_level,
            price_optimization: Default::default(),
            current_hour_used_kwh: used_kwh,
            current_hour_budget_kwh: guard_snapshot.capacity_soft_limit_kw,
            controlled_kw: tracker_controlled,
            uncontrolled_kw: tracker_uncontrolled,
            minutes_remaining,
            now,
        };

        let mut engine_state = self.engine_state.lock().await;
        let plan = build_plan(input, &mut engine_state);
        drop(engine_state);

        // Diff/persist/emit before apply (§5 ordering guarantee): a crash
        // between here and the SDK calls below leaves the persisted plan
        // ahead of physical device state, never the reverse.
        self.plan_service.on_new_plan(&plan, price_level).await;
        *self.last_plan.write().await = Some(plan.clone());

        {
            let mut locks = self.device_locks.lock().await;
            device_locks_for(&plan, &mut locks);
            let locks_snapshot = locks.clone();
            drop(locks);

            let mut guard = self.guard.lock().await;
            let mut engine_state = self.engine_state.lock().await;
            execute_plan(
                &plan,
                &*self.sdk,
                capacity_settings.dry_run,
                &locks_snapshot,
                &mut guard,
                &mut engine_state,
                now.timestamp_millis(),
            )
            .await;
            let in_shortfall = guard.in_shortfall();
            drop(guard);
            drop(engine_state);
            let _ = self
                .settings
                .set(keys::CAPACITY_IN_SHORTFALL, serde_json::json!(in_shortfall))
                .await;
        }
    }
}

fn telemetry_to_snapshot(
    t: &crate::sdk::DeviceTelemetry,
    now: chrono::DateTime<chrono::Utc>,
) -> crate::domain::device::DeviceSnapshot {
    use crate::domain::device::{DeviceCapabilities, EnergyHints};
    crate::domain::device::DeviceSnapshot {
        id: t.id.clone(),
        name: t.name.clone(),
        zone: t.zone.clone(),
        controllable: true,
        managed: true,
        capabilities: DeviceCapabilities {
            has_onoff: t.has_onoff,
            has_target_temperature: t.has_target_temperature,
            has_measure_power: t.has_measure_power,
            min_temperature: t.min_temperature,
            max_temperature: t.max_temperature,
        },
        current_on: t.current_on,
        current_temperature: t.current_temperature,
        current_target: t.current_target,
        measured_power_kw: t.measured_power_kw,
        manual_override_kw: None,
        load_setting_kw: t.load_setting_kw,
        energy_hints: EnergyHints {
            energy_value_on_kw: t.energy_value_on_kw,
            energy_value_off_kw: t.energy_value_off_kw,
            approximation_kw: t.approximation_kw,
            energy_w: t.energy_w,
        },
        expected_power_kw: 0.0,
        expected_power_source: crate::domain::device::ExpectedPowerSource::Default,
        load_kw: None,
        available: t.available,
        last_updated: now,
    }
}

/// Reads a `{deviceId: bool}` settings map, defaulting to empty (all devices
/// left at their `DeviceSnapshot` default of `true`) when absent or malformed.
async fn read_bool_overrides(settings: &dyn SettingsStore, key: &str) -> HashMap<String, bool> {
    settings
        .get(key)
        .await
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

async fn read_capacity_settings(settings: &dyn SettingsStore, config: &AppConfig) -> CapacitySettings {
    let mut cfg = CapacitySettings {
        limit_kw: config.capacity.limit_kw,
        margin_kw: config.capacity.margin_kw,
        restore_margin_kw: config.capacity.restore_margin_kw,
        dry_run: config.capacity.dry_run,
    };
    if let Ok(Some(v)) = settings.get(keys::CAPACITY_LIMIT_KW).await {
        if let Some(n) = v.as_f64() {
            cfg.limit_kw = n;
        }
    }
    if let Ok(Some(v)) = settings.get(keys::CAPACITY_MARGIN_KW).await {
        if let Some(n) = v.as_f64() {
            cfg.margin_kw = n;
        }
    }
    if let Ok(Some(v)) = settings.get(keys::CAPACITY_RESTORE_MARGIN_KW).await {
        if let Some(n) = v.as_f64() {
            cfg.restore_margin_kw = n;
        }
    }
    if let Ok(Some(v)) = settings.get(keys::CAPACITY_DRY_RUN).await {
        if let Some(b) = v.as_bool() {
            cfg.dry_run = b;
        }
    }
    cfg.sanitized()
}

async fn read_mode_config(settings: &dyn SettingsStore) -> ModeConfig {
    let mut cfg = ModeConfig::default();
    if let Ok(Some(v)) = settings.get(keys::MODE_ALIASES).await {
        if let Ok(m) = serde_json::from_value(v) {
            cfg.mode_aliases = m;
        }
    }
    if let Ok(Some(v)) = settings.get(keys::MODE_DEVICE_TARGETS).await {
        if let Ok(m) = serde_json::from_value(v) {
            cfg.mode_device_targets = m;
        }
    }
    if let Ok(Some(v)) = settings.get(keys::CAPACITY_PRIORITIES).await {
        if let Ok(m) = serde_json::from_value(v) {
            cfg.capacity_priorities = m;
        }
    }
    cfg
}

/// Spawns the five long-running tasks described in §5.1: tick loop, hourly
/// loop, rebuild worker, settings-change listener, and HTTP server. Returns
/// once all tasks have been scheduled; shutdown is cooperative via
/// `telemetry::shutdown_signal`.
pub fn spawn_tasks(
    state: AppState,
    mut rebuild_rx: tokio::sync::mpsc::UnboundedReceiver<crate::plan::RebuildRequest>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Rebuild worker: single FIFO consumer (§4.6).
    {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            while let Some(request) = rebuild_rx.recv().await {
                let start = std::time::Instant::now();
                info!(reason = %request.reason, "running rebuild");
                state.rebuild().await;
                state.plan_service.stats.record_complete(start.elapsed());
            }
        }));
    }

    // Tick loop (~10s, configurable).
    {
        let state = state.clone();
        let tick = std::time::Duration::from_secs(state.config.controller.tick_seconds);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                state.plan_service.stats.record_enqueue("tick");
                state.rebuild_queue.enqueue("tick");
            }
        }));
    }

    // Hourly loop, aligned to wall-clock (§5.1).
    {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let delay = duration_until_next_hour(chrono::Utc::now());
                tokio::time::sleep(delay.to_std().unwrap_or(std::time::Duration::from_secs(3600))).await;
                state.plan_service.stats.record_enqueue("hourly");
                state.rebuild_queue.enqueue("hourly");
            }
        }));
    }

    // Settings-change listener: any key write may warrant a rebuild.
    {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let mut rx = state.settings.subscribe().await;
            loop {
                match rx.recv().await {
                    Ok(key) if is_rebuild_relevant(&key) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            let lock = {
                                let mut locks = state.settings_key_locks.lock().await;
                                locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
                            };
                            let _guard = lock.lock().await;
                            state.plan_service.stats.record_enqueue("settings");
                            state.rebuild_queue.enqueue(format!("settings:{key}"));
                        });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        warn!("settings subscriber lagged, dropped notifications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    handles
}

fn is_rebuild_relevant(key: &str) -> bool {
    !matches!(
        key,
        crate::settings::keys::DEVICE_PLAN_SNAPSHOT
            | crate::settings::keys::PELS_STATUS
            | crate::settings::keys::CAPACITY_IN_SHORTFALL
            | crate::settings::keys::POWER_TRACKER_STATE
            | crate::settings::keys::EXPECTED_POWER_PEAKS
    )
}
