pub mod config;
pub mod error;

pub use config::{Config, LockConfig, MonitorConfig, SchedulerConfig, ServerConfig};
pub use error::ConfigError;
