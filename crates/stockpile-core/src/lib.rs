//! # Stockpile Core
//!
//! Shared foundation for the Stockpile collection scheduler:
//! configuration loading and the common error type.

pub mod config;
pub mod error;

pub use config::{CollectorsConfig, DatabaseConfig, SchedulerConfig, StockpileConfig};
pub use error::{Result, StockpileError};
