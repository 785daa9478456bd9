pub mod commands;
pub mod start;
pub mod telemetry;

pub use start::start;
