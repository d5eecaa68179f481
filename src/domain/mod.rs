pub mod budget;
pub mod device;
pub mod mode;
pub mod plan;
pub mod price;
pub mod settings_types;

pub use budget::*;
pub use device::*;
pub use mode::*;
pub use plan::*;
pub use price::*;
pub use settings_types::*;
