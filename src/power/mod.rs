pub mod estimator;
pub mod tracker;

pub use estimator::{PowerEstimate, PowerEstimator};
pub use tracker::{duration_until_next_hour, HourBucket, PowerTracker, PowerTrackerState, RETAIN_HOURS};
