use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// How many prior hour buckets are retained alongside the current one (§4.2).
/// Spans a full local day even across a DST fall-back hour.
pub const RETAIN_HOURS: u32 = 26;

/// One hour's worth of integrated energy, split into the portion drawn by
/// currently-controllable devices versus everything else.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HourBucket {
    pub controlled_kwh: f64,
    pub uncontrolled_kwh: f64,
}

impl HourBucket {
    pub fn total_kwh(&self) -> f64 {
        self.controlled_kwh + self.uncontrolled_kwh
    }
}

/// Persisted shape for `power_tracker_state` (§4.2, §3.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerTrackerState {
    /// Hour-start, millis since epoch -> bucket.
    pub buckets: BTreeMap<i64, HourBucket>,
    pub last_timestamp_ms: Option<i64>,
    pub last_power_kw: Option<f64>,
}

/// Rolling-window energy tracker keyed by local hour-start (§4.2).
///
/// Never panics on a malformed persisted state: missing/garbled buckets are
/// simply dropped during `restore`, matching the Plan Builder's
/// never-throws failure posture elsewhere in this crate.
pub struct PowerTracker {
    tz: Tz,
    buckets: BTreeMap<i64, HourBucket>,
    last_sample: Option<(DateTime<Utc>, f64)>,
}

impl PowerTracker {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            buckets: BTreeMap::new(),
            last_sample: None,
        }
    }

    pub fn restore(tz: Tz, state: PowerTrackerState) -> Self {
        let mut tracker = Self::new(tz);
        tracker.buckets = state.buckets;
        if let (Some(ms), Some(kw)) = (state.last_timestamp_ms, state.last_power_kw) {
            if let Some(ts) = Utc.timestamp_millis_opt(ms).single() {
                tracker.last_sample = Some((ts, kw));
            }
        }
        tracker
    }

    pub fn snapshot(&self) -> PowerTrackerState {
        PowerTrackerState {
            buckets: self.buckets.clone(),
            last_timestamp_ms: self.last_sample.map(|(ts, _)| ts.timestamp_millis()),
            last_power_kw: self.last_sample.map(|(_, kw)| kw),
        }
    }

    /// Hour-start key in the configured local time zone, as UTC millis.
    fn hour_start_key(&self, t: DateTime<Utc>) -> i64 {
        use chrono::Timelike;
        let local = t.with_timezone(&self.tz);
        let hour_start_naive = local
            .date_naive()
            .and_hms_opt(local.hour(), 0, 0)
            .unwrap_or_else(|| local.naive_local());
        self.tz
            .from_local_datetime(&hour_start_naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(t)
            .timestamp_millis()
    }

    /// Record one power sample, splitting its integrated energy into
    /// controlled/uncontrolled per the estimator's current classification.
    pub fn record_sample(&mut self, t: DateTime<Utc>, total_kw: f64, controlled_kw: f64) {
        if !total_kw.is_finite() {
            return;
        }
        let controlled_kw = controlled_kw.clamp(0.0, total_kw.max(0.0));
        let key = self.hour_start_key(t);

        let energy_kwh = match self.last_sample {
            Some((prev_t, prev_kw)) if self.hour_start_key(prev_t) == key => {
                let dt_hours = (t - prev_t).num_milliseconds() as f64 / 3_600_000.0;
                if dt_hours > 0.0 {
                    dt_hours * (prev_kw + total_kw) / 2.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let controlled_frac = if total_kw > 0.0 {
            controlled_kw / total_kw
        } else {
            0.0
        };

        let bucket = self.buckets.entry(key).or_default();
        bucket.controlled_kwh += energy_kwh * controlled_frac;
        bucket.uncontrolled_kwh += energy_kwh * (1.0 - controlled_frac);

        self.last_sample = Some((t, total_kw));
        self.evict_older_than(key);
    }

    fn evict_older_than(&mut self, current_key: i64) {
        let floor = current_key - (RETAIN_HOURS as i64) * 3_600_000;
        self.buckets.retain(|&k, _| k >= floor);
    }

    pub fn current_hour_start_ms(&self) -> Option<i64> {
        self.last_sample.map(|(t, _)| self.hour_start_key(t))
    }

    pub fn current_hour_used_kwh(&self) -> f64 {
        self.current_hour_start_ms()
            .and_then(|k| self.buckets.get(&k))
            .map(|b| b.total_kwh())
            .unwrap_or(0.0)
    }

    pub fn current_hour_controlled_kwh(&self) -> f64 {
        self.current_hour_start_ms()
            .and_then(|k| self.buckets.get(&k))
            .map(|b| b.controlled_kwh)
            .unwrap_or(0.0)
    }

    pub fn current_hour_uncontrolled_kwh(&self) -> f64 {
        self.current_hour_start_ms()
            .and_then(|k| self.buckets.get(&k))
            .map(|b| b.uncontrolled_kwh)
            .unwrap_or(0.0)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_sample.map(|(t, _)| t)
    }

    pub fn minutes_remaining_in_hour(&self, now: DateTime<Utc>) -> u32 {
        use chrono::Timelike;
        let local = now.with_timezone(&self.tz);
        (60 - local.minute()).clamp(1, 60)
    }

    pub fn buckets(&self) -> &BTreeMap<i64, HourBucket> {
        &self.buckets
    }
}

/// Wall-clock-aligned delay until the top of the next hour (UTC), per §5.1.
pub fn duration_until_next_hour(now: DateTime<Utc>) -> ChronoDuration {
    use chrono::Timelike;
    let elapsed = ChronoDuration::minutes(now.minute() as i64) + ChronoDuration::seconds(now.second() as i64);
    (ChronoDuration::hours(1) - elapsed).max(ChronoDuration::seconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn tz() -> Tz {
        "Europe/Oslo".parse().unwrap()
    }

    #[test]
    fn first_sample_in_hour_integrates_zero_energy() {
        let mut tracker = PowerTracker::new(tz());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        tracker.record_sample(t0, 4.0, 4.0);
        assert_eq!(tracker.current_hour_used_kwh(), 0.0);
    }

    #[test]
    fn trapezoid_integration_within_hour() {
        let mut tracker = PowerTracker::new(tz());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let t1 = t0 + ChronoDuration::minutes(30);
        tracker.record_sample(t0, 4.0, 4.0);
        tracker.record_sample(t1, 6.0, 6.0);
        // trapezoid: 0.5h * (4+6)/2 = 2.5 kWh
        assert!((tracker.current_hour_used_kwh() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn crossing_hour_boundary_starts_fresh_bucket() {
        let mut tracker = PowerTracker::new(tz());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 55, 0).unwrap();
        let t1 = t0 + ChronoDuration::minutes(10); // crosses into 11:00
        tracker.record_sample(t0, 4.0, 4.0);
        tracker.record_sample(t1, 4.0, 4.0);
        assert_eq!(tracker.current_hour_used_kwh(), 0.0);
        assert_eq!(tracker.buckets().len(), 2);
    }

    #[test]
    fn retention_evicts_old_buckets() {
        let mut tracker = PowerTracker::new(tz());
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for h in 0..40 {
            tracker.record_sample(base + ChronoDuration::hours(h), 1.0, 1.0);
        }
        assert!(tracker.buckets().len() as u32 <= RETAIN_HOURS + 1);
    }

    #[test]
    fn restore_roundtrips_through_snapshot() {
        let mut tracker = PowerTracker::new(tz());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        tracker.record_sample(t0, 4.0, 2.0);
        let snap = tracker.snapshot();
        let restored = PowerTracker::restore(tz(), snap);
        assert_eq!(
            restored.current_hour_used_kwh(),
            tracker.current_hour_used_kwh()
        );
    }
}
