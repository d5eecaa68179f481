use chrono::{DateTime, Utc};

use crate::domain::price::{PriceLevel, PricePoint};

/// Symmetric threshold-percent, with an absolute floor, for classifying an
/// hour as cheap/expensive against the mean of loaded prices (§4.7).
pub const PRICE_THRESHOLD_PCT: f64 = 0.10;
pub const PRICE_MIN_DIFF_PER_KWH: f64 = 0.10;

/// Supplies the hourly price series the Plan Engine classifies against.
/// A real backend (Nordpool, Tibber, ...) implements this; `StaticPriceSource`
/// is the in-memory stand-in used by tests and the simulated SDK.
///
/// Plain (non-async) on purpose: prices are refreshed out-of-band (by a
/// settings write or a background fetch) and read synchronously from the
/// hot rebuild path.
pub trait PriceSource: Send + Sync {
    fn combined_prices(&self) -> &[PricePoint];

    /// Classify `at`'s hour against the loaded series. Default
    /// implementation follows the threshold-percent +/- minimum-absolute-
    /// difference rule from §4.7; a backend with its own notion of
    /// "cheap"/"expensive" may override this instead of `combined_prices`.
    fn price_level(&self, at: DateTime<Utc>) -> PriceLevel {
        classify(self.combined_prices(), at)
    }
}

/// Pure classification function, split out from the trait so it can be unit
/// tested without constructing a `PriceSource`.
pub fn classify(prices: &[PricePoint], at: DateTime<Utc>) -> PriceLevel {
    if prices.is_empty() {
        return PriceLevel::Unknown;
    }
    let mean = prices.iter().map(|p| p.price_per_kwh).sum::<f64>() / prices.len() as f64;
    let threshold = (mean * PRICE_THRESHOLD_PCT).max(PRICE_MIN_DIFF_PER_KWH);

    let current = prices.iter().filter(|p| p.hour_start <= at).max_by_key(|p| p.hour_start);

    let Some(current) = current else {
        return PriceLevel::Unknown;
    };

    if current.price_per_kwh <= mean - threshold {
        PriceLevel::Cheap
    } else if current.price_per_kwh >= mean + threshold {
        PriceLevel::Expensive
    } else {
        PriceLevel::Normal
    }
}

/// Simple fixed-series `PriceSource`, useful for tests and the simulated
/// SDK where prices are supplied up front rather than fetched.
pub struct StaticPriceSource {
    prices: Vec<PricePoint>,
}

impl StaticPriceSource {
    pub fn new(prices: Vec<PricePoint>) -> Self {
        Self { prices }
    }

    pub fn empty() -> Self {
        Self { prices: Vec::new() }
    }

    pub fn set_prices(&mut self, prices: Vec<PricePoint>) {
        self.prices = prices;
    }
}

impl PriceSource for StaticPriceSource {
    fn combined_prices(&self) -> &[PricePoint] {
        &self.prices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(hour: u32, price: f64) -> PricePoint {
        PricePoint {
            hour_start: Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap(),
            price_per_kwh: price,
        }
    }

    #[test]
    fn empty_series_is_unknown() {
        assert_eq!(classify(&[], Utc::now()), PriceLevel::Unknown);
    }

    #[test]
    fn classifies_cheap_normal_expensive() {
        let prices = vec![point(0, 1.0), point(1, 1.0), point(2, 1.0), point(3, 2.0)];
        // mean = 1.25, threshold = max(0.125, 0.10) = 0.125
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        assert_eq!(classify(&prices, now), PriceLevel::Normal);

        let now_expensive = Utc.with_ymd_and_hms(2026, 1, 1, 3, 30, 0).unwrap();
        assert_eq!(classify(&prices, now_expensive), PriceLevel::Expensive);
    }

    #[test]
    fn absolute_floor_prevents_tiny_deltas_from_counting() {
        // Prices barely differ; threshold_pct alone would be too small, the
        // absolute floor (0.10) keeps everything "normal".
        let prices = vec![point(0, 1.00), point(1, 1.02), point(2, 0.99)];
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 1, 30, 0).unwrap();
        assert_eq!(classify(&prices, now), PriceLevel::Normal);
    }

    #[test]
    fn source_delegates_to_classify() {
        let src = StaticPriceSource::new(vec![point(0, 1.0), point(1, 1.0)]);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 1, 30, 0).unwrap();
        assert_eq!(src.price_level(now), PriceLevel::Normal);
    }
}
