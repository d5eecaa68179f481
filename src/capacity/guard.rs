use std::time::{Duration, Instant};

use tracing::info;

/// Clearing a latched shortfall requires this much margin below the
/// shortfall threshold (§4.1).
pub const CLEAR_MARGIN_KW: f64 = 0.2;
/// ... sustained for this long (§4.1).
pub const CLEAR_SUSTAIN: Duration = Duration::from_secs(60);

/// Holds contract limit, soft margin, last measured power, and the two
/// latched booleans (shedding-active, in-shortfall) described in §4.1.
///
/// Guard is deliberately free of any async/SDK knowledge: it is pure state
/// plus two fire-and-forget callback slots (`on_shedding_*`, `on_shortfall*`)
/// invoked synchronously from within `set_shedding_active`/`check_shortfall`.
/// Callers that need to do I/O in response subscribe to those callbacks and
/// queue the work themselves (§4.1 rationale, §7 "fire-and-forget").
pub struct CapacityGuard {
    limit_kw: f64,
    soft_margin_kw: f64,
    restore_margin_kw: f64,
    main_power_kw: Option<f64>,
    shedding_active: bool,
    in_shortfall: bool,
    shortfall_clear_start: Option<Instant>,

    soft_limit_override: Option<f64>,
    shortfall_threshold_override: Option<f64>,

    on_shedding_start: Option<Box<dyn Fn() + Send + Sync>>,
    on_shedding_end: Option<Box<dyn Fn() + Send + Sync>>,
    on_shortfall: Option<Box<dyn Fn(f64) + Send + Sync>>,
    on_shortfall_cleared: Option<Box<dyn Fn() + Send + Sync>>,
}

impl CapacityGuard {
    pub fn new(limit_kw: f64, soft_margin_kw: f64, restore_margin_kw: f64) -> Self {
        Self {
            limit_kw,
            soft_margin_kw,
            restore_margin_kw,
            main_power_kw: None,
            shedding_active: false,
            in_shortfall: false,
            shortfall_clear_start: None,
            soft_limit_override: None,
            shortfall_threshold_override: None,
            on_shedding_start: None,
            on_shedding_end: None,
            on_shortfall: None,
            on_shortfall_cleared: None,
        }
    }

    /// Re-hydrate the latched shortfall flag from persisted settings
    /// (`capacity_in_shortfall`), per the resolved open question in §9.
    pub fn with_persisted_shortfall(mut self, in_shortfall: bool) -> Self {
        self.in_shortfall = in_shortfall;
        self
    }

    pub fn set_on_shedding_start(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.on_shedding_start = Some(Box::new(f));
    }
    pub fn set_on_shedding_end(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.on_shedding_end = Some(Box::new(f));
    }
    pub fn set_on_shortfall(&mut self, f: impl Fn(f64) + Send + Sync + 'static) {
        self.on_shortfall = Some(Box::new(f));
    }
    pub fn set_on_shortfall_cleared(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.on_shortfall_cleared = Some(Box::new(f));
    }

    pub fn set_soft_limit_override(&mut self, kw: Option<f64>) {
        self.soft_limit_override = kw;
    }

    pub fn set_shortfall_threshold_override(&mut self, kw: Option<f64>) {
        self.shortfall_threshold_override = kw;
    }

    pub fn limit_kw(&self) -> f64 {
        self.limit_kw
    }

    pub fn set_limit_kw(&mut self, kw: f64) {
        self.limit_kw = kw;
    }

    pub fn set_margin_kw(&mut self, kw: f64) {
        self.soft_margin_kw = kw;
    }

    pub fn set_restore_margin_kw(&mut self, kw: f64) {
        self.restore_margin_kw = kw;
    }

    pub fn restore_margin_kw(&self) -> f64 {
        self.restore_margin_kw
    }

    pub fn report_total_power(&mut self, kw: f64) {
        if kw.is_finite() {
            self.main_power_kw = Some(kw);
        }
    }

    pub fn main_power_kw(&self) -> Option<f64> {
        self.main_power_kw
    }

    /// The working ceiling used for planning: `override ?? max(0, limit - margin)`.
    pub fn soft_limit(&self) -> f64 {
        self.soft_limit_override
            .unwrap_or_else(|| (self.limit_kw - self.soft_margin_kw).max(0.0))
    }

    pub fn headroom(&self) -> Option<f64> {
        self.main_power_kw.map(|p| self.soft_limit() - p)
    }

    /// The hard panic threshold: always the contract limit unless a test or
    /// caller installs an override (§4.4: `computeShortfallThreshold` always
    /// returns the contract limit in production use).
    pub fn shortfall_threshold(&self) -> f64 {
        self.shortfall_threshold_override.unwrap_or(self.limit_kw)
    }

    pub fn shedding_active(&self) -> bool {
        self.shedding_active
    }

    pub fn in_shortfall(&self) -> bool {
        self.in_shortfall
    }

    pub fn set_shedding_active(&mut self, active: bool) {
        if active == self.shedding_active {
            return;
        }
        self.shedding_active = active;
        if active {
            if let Some(cb) = &self.on_shedding_start {
                cb();
            }
        } else if let Some(cb) = &self.on_shedding_end {
            cb();
        }
    }

    /// Enter shortfall only when measured power exceeds the hard threshold
    /// and there is nothing left to shed; clear only after sustained margin
    /// (§4.1, invariant 6 in §3).
    pub fn check_shortfall(&mut self, has_candidates: bool, deficit_kw: f64) {
        let Some(power) = self.main_power_kw else {
            return;
        };
        let threshold = self.shortfall_threshold();

        if !self.in_shortfall {
            if power > threshold && !has_candidates {
                self.in_shortfall = true;
                self.shortfall_clear_start = None;
                info!(deficit_kw, power, threshold, "capacity shortfall latched");
                if let Some(cb) = &self.on_shortfall {
                    cb(deficit_kw);
                }
            }
            return;
        }

        let margin = threshold - power;
        if margin >= CLEAR_MARGIN_KW {
            match self.shortfall_clear_start {
                None => self.shortfall_clear_start = Some(Instant::now()),
                Some(start) if start.elapsed() >= CLEAR_SUSTAIN => {
                    self.in_shortfall = false;
                    self.shortfall_clear_start = None;
                    info!("capacity shortfall cleared");
                    if let Some(cb) = &self.on_shortfall_cleared {
                        cb();
                    }
                }
                Some(_) => {}
            }
        } else {
            // Any dip below the clearing margin resets the sustain timer.
            self.shortfall_clear_start = None;
        }
    }
}
