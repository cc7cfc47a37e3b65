pub mod error;
pub mod scheduled_executor;

pub use error::{CollectorError, CollectorResult};
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask};
