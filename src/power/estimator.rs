use std::collections::HashMap;

use crate::domain::device::{DeviceSnapshot, ExpectedPowerSource};

/// Per-cycle result of estimating one device's power contribution (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct PowerEstimate {
    pub power_kw: f64,
    pub expected_power_kw: f64,
    pub source: ExpectedPowerSource,
    pub measured_power_kw: Option<f64>,
    pub load_kw: Option<f64>,
}

/// Owns per-device historic-peak state, persisted under the
/// `expected_power_peaks` settings key (§4.3, ADDED).
#[derive(Debug, Clone, Default)]
pub struct PowerEstimator {
    historic_peaks: HashMap<String, f64>,
}

impl PowerEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(peaks: HashMap<String, f64>) -> Self {
        Self {
            historic_peaks: peaks,
        }
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.historic_peaks.clone()
    }

    /// Rule cascade from §4.3. Never fails; always returns a usable estimate.
    pub fn estimate(&mut self, device: &DeviceSnapshot) -> PowerEstimate {
        let measured = device.measured_power_kw.filter(|v| v.is_finite());

        // Rule 1: manual override.
        if let Some(manual) = device.manual_override_kw.filter(|v| v.is_finite()) {
            return match measured {
                Some(m) if m > manual => {
                    self.record_peak(&device.id, m);
                    PowerEstimate {
                        power_kw: m,
                        expected_power_kw: m,
                        source: ExpectedPowerSource::MeasuredPeak,
                        measured_power_kw: measured,
                        load_kw: None,
                    }
                }
                _ => PowerEstimate {
                    power_kw: manual,
                    expected_power_kw: manual,
                    source: ExpectedPowerSource::Manual,
                    measured_power_kw: measured,
                    load_kw: None,
                },
            };
        }

        // Rule 2: explicit load setting.
        if let Some(load) = device.load_setting_kw.filter(|v| v.is_finite() && *v > 0.0) {
            if let Some(m) = measured {
                self.record_peak(&device.id, m);
            }
            return PowerEstimate {
                power_kw: load,
                expected_power_kw: load,
                source: ExpectedPowerSource::LoadSetting,
                measured_power_kw: measured,
                load_kw: Some(load),
            };
        }

        // Rule 3: historic peak.
        if let Some(&peak) = self.historic_peaks.get(&device.id) {
            if let Some(m) = measured {
                if m > peak {
                    self.record_peak(&device.id, m);
                }
            }
            let peak = self.historic_peaks.get(&device.id).copied().unwrap_or(peak);
            return PowerEstimate {
                power_kw: peak,
                expected_power_kw: peak,
                source: ExpectedPowerSource::MeasuredPeak,
                measured_power_kw: measured,
                load_kw: None,
            };
        }

        if let Some(m) = measured {
            self.record_peak(&device.id, m);
        }

        // Rule 4: platform-provided energy estimate.
        if let Some(platform_kw) = self.platform_energy_kw(device) {
            return PowerEstimate {
                power_kw: platform_kw,
                expected_power_kw: platform_kw,
                source: ExpectedPowerSource::PlatformEnergy,
                measured_power_kw: measured,
                load_kw: None,
            };
        }

        // Rule 5: default.
        PowerEstimate {
            power_kw: 1.0,
            expected_power_kw: 1.0,
            source: ExpectedPowerSource::Default,
            measured_power_kw: measured,
            load_kw: None,
        }
    }

    fn record_peak(&mut self, device_id: &str, measured_kw: f64) {
        let entry = self.historic_peaks.entry(device_id.to_string()).or_insert(0.0);
        if measured_kw > *entry {
            *entry = measured_kw;
        }
    }

    fn platform_energy_kw(&self, device: &DeviceSnapshot) -> Option<f64> {
        let hints = &device.energy_hints;
        if let (Some(on), Some(off)) = (hints.energy_value_on_kw, hints.energy_value_off_kw) {
            let delta = on - off;
            if delta.is_finite() && delta > 0.0 {
                return Some(delta);
            }
        }
        if let Some(approx) = hints.approximation_kw.filter(|v| v.is_finite() && *v > 0.0) {
            return Some(approx);
        }
        if device.current_on == Some(true) {
            if let Some(watts) = hints.energy_w.filter(|v| v.is_finite() && *v > 0.0) {
                return Some(watts / 1000.0);
            }
        }
        None
    }
}
