pub mod guard;

pub use guard::{CapacityGuard, CLEAR_MARGIN_KW, CLEAR_SUSTAIN};
