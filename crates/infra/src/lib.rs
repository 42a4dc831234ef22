//! Infrastructure layer: key-value stores, result cache, background jobs, config.

pub mod cache;
pub mod clock;
pub mod config;
pub mod jobs;
pub mod kv;
pub mod perf;
pub mod persistence;
pub mod runtime;
pub mod tasks;


pub use config::{ConfigError, Settings};
pub use runtime::{EstimationCore, InitError};
