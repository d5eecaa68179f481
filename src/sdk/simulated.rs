use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DeviceSdk, DeviceTelemetry};

#[derive(Debug, Clone)]
struct SimulatedDevice {
    telemetry: DeviceTelemetry,
    power_when_on_kw: f64,
}

/// In-memory `DeviceSdk` used by integration tests and local runs without a
/// real platform behind it (§6.1: "real, runnable ... not stubs").
///
/// Each device has a fixed nominal power draw while on; `set_onoff` and
/// `set_target_temperature` mutate the held telemetry directly rather than
/// going over any transport, so tests can assert on the resulting snapshot
/// without waiting on I/O.
pub struct InMemoryDeviceSdk {
    devices: Arc<Mutex<HashMap<String, SimulatedDevice>>>,
}

impl InMemoryDeviceSdk {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_device(self, telemetry: DeviceTelemetry, power_when_on_kw: f64) -> Self {
        self.devices.lock().insert(
            telemetry.id.clone(),
            SimulatedDevice {
                telemetry,
                power_when_on_kw,
            },
        );
        self
    }

    /// Test hook: push a fresh measured-power reading for a device, as if a
    /// meter sample had just arrived.
    pub fn set_measured_power(&self, device_id: &str, kw: f64) {
        if let Some(d) = self.devices.lock().get_mut(device_id) {
            d.telemetry.measured_power_kw = Some(kw);
        }
    }
}

impl Default for InMemoryDeviceSdk {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceSdk for InMemoryDeviceSdk {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceTelemetry>> {
        Ok(self.devices.lock().values().map(|d| d.telemetry.clone()).collect())
    }

    async fn set_onoff(&self, device_id: &str, on: bool) -> anyhow::Result<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow::anyhow!("unknown device {device_id}"))?;
        device.telemetry.current_on = Some(on);
        device.telemetry.measured_power_kw = Some(if on { device.power_when_on_kw } else { 0.0 });
        Ok(())
    }

    async fn set_target_temperature(&self, device_id: &str, celsius: f64) -> anyhow::Result<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow::anyhow!("unknown device {device_id}"))?;
        device.telemetry.current_target = Some(celsius);
        Ok(())
    }

    async fn mark_unavailable(&self, device_id: &str) {
        if let Some(d) = self.devices.lock().get_mut(device_id) {
            d.telemetry.available = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            current_on: Some(false),
            current_temperature: None,
            current_target: None,
            measured_power_kw: Some(0.0),
            load_setting_kw: None,
            energy_value_on_kw: None,
            energy_value_off_kw: None,
            approximation_kw: None,
            energy_w: None,
        }
    }

    #[tokio::test]
    async fn set_onoff_updates_measured_power() {
        let sdk = InMemoryDeviceSdk::new().with_device(telemetry("heater"), 2.0);
        sdk.set_onoff("heater", true).await.unwrap();
        let devices = sdk.list_devices().await.unwrap();
        assert_eq!(devices[0].current_on, Some(true));
        assert_eq!(devices[0].measured_power_kw, Some(2.0));
    }

    #[tokio::test]
    async fn unknown_device_errors() {
        let sdk = InMemoryDeviceSdk::new();
        assert!(sdk.set_onoff("missing", true).await.is_err());
    }

    #[tokio::test]
    async fn mark_unavailable_flips_flag() {
        let sdk = InMemoryDeviceSdk::new().with_device(telemetry("heater"), 2.0);
        sdk.mark_unavailable("heater").await;
        let devices = sdk.list_devices().await.unwrap();
        assert!(!devices[0].available);
    }
}
