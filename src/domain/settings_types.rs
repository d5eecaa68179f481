use serde::{Deserialize, Serialize};

/// Contract-level capacity settings (§3). Defaults match the Plan Builder's
/// documented fallback values so a missing/malformed settings read never
/// panics the rebuild path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySettings {
    pub limit_kw: f64,
    pub margin_kw: f64,
    pub restore_margin_kw: f64,
    pub dry_run: bool,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            limit_kw: 10.0,
            margin_kw: 0.2,
            restore_margin_kw: 0.3,
            dry_run: false,
        }
    }
}

impl CapacitySettings {
    /// Substitute defaults for any non-finite field, per §4.4's failure
    /// semantics ("malformed settings ... fall back to defaults").
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        Self {
            limit_kw: finite_or(self.limit_kw, defaults.limit_kw),
            margin_kw: finite_or(self.margin_kw, defaults.margin_kw),
            restore_margin_kw: finite_or(self.restore_margin_kw, defaults.restore_margin_kw),
            dry_run: self.dry_run,
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        fallback
    }
}

pub const DEFAULT_MODE: &str = "Home";
