use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default priority assigned to a device absent from the active mode's
/// priority map — see invariant 2 in §3: shed first.
pub const DEFAULT_PRIORITY: i32 = 999;

/// The operating-mode profile: which devices matter in what order, and what
/// temperature each should run at while kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeConfig {
    /// lowercased alias -> canonical mode name
    pub mode_aliases: HashMap<String, String>,
    /// mode -> deviceId -> target temperature
    pub mode_device_targets: HashMap<String, HashMap<String, f64>>,
    /// mode -> deviceId -> priority (1 = most important)
    pub capacity_priorities: HashMap<String, HashMap<String, i32>>,
}

impl ModeConfig {
    /// Resolve a possibly-aliased mode string to its canonical name. Unknown
    /// aliases pass through unchanged (the mode simply has no priorities).
    pub fn canonicalize(&self, mode: &str) -> String {
        self.mode_aliases
            .get(&mode.to_lowercase())
            .cloned()
            .unwrap_or_else(|| mode.to_string())
    }

    pub fn priority(&self, mode: &str, device_id: &str) -> i32 {
        self.capacity_priorities
            .get(mode)
            .and_then(|m| m.get(device_id))
            .copied()
            .unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn target_temperature(&self, mode: &str, device_id: &str) -> Option<f64> {
        self.mode_device_targets
            .get(mode)
            .and_then(|m| m.get(device_id))
            .copied()
    }
}

/// Per-device shed behaviour: what an actual shed *does* to the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ShedBehavior {
    TurnOff,
    SetTemperature { temperature: f64 },
}

impl Default for ShedBehavior {
    fn default() -> Self {
        ShedBehavior::TurnOff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_gets_default_priority() {
        let cfg = ModeConfig::default();
        assert_eq!(cfg.priority("Home", "missing"), DEFAULT_PRIORITY);
    }

    #[test]
    fn alias_resolves_case_insensitively() {
        let mut cfg = ModeConfig::default();
        cfg.mode_aliases.insert("bort".to_string(), "Away".to_string());
        assert_eq!(cfg.canonicalize("BORT"), "Away");
        assert_eq!(cfg.canonicalize("Home"), "Home");
    }
}
