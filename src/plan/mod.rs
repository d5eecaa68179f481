pub mod builder;
pub mod executor;
pub mod service;
pub mod state;

pub use builder::{
    build_plan, compute_shortfall_threshold, GuardSnapshot, PlanBuilderInput, RESTORE_COOLDOWN, RESTORE_MARGIN_KW,
    SWAP_SETTLE_MS,
};
pub use executor::{execute_plan, DeviceLocks, SDK_CALL_TIMEOUT};
pub use service::{PelsStatus, PlanService, RebuildQueue, RebuildRequest, RebuildStats};
pub use state::PlanEngineState;
