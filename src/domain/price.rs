use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Coarse classification of the current hour's spot price (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PriceLevel {
    #[default]
    Unknown,
    Cheap,
    Normal,
    Expensive,
}

/// A single hourly spot price point, as the price-fetcher collaborator would
/// hand it to us (currency-per-kWh units, hour-aligned).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub hour_start: DateTime<Utc>,
    pub price_per_kwh: f64,
}

/// Per-device price-shaping configuration: offsets applied to the mode's
/// target temperature depending on the current price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceOptimizationConfig {
    pub enabled: bool,
    pub cheap_delta: f64,
    pub expensive_delta: f64,
}

impl Default for PriceOptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cheap_delta: 0.0,
            expensive_delta: 0.0,
        }
    }
}
