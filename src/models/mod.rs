pub mod ash;
pub mod feature;
pub mod plan;
pub mod record;

pub use ash::*;
pub use feature::*;
pub use plan::*;
pub use record::*;
