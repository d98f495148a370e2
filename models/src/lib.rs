pub mod config;
pub mod constants;
pub mod node;
pub mod telemetry;
