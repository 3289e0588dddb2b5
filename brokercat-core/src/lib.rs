//! Brokercat library exports

pub mod catalog;
pub mod config;
pub mod trust;

pub use catalog::{BrokerRecord, CatalogLoader, Platform, RefreshError, RefreshOutcome, Tier};
pub use config::{CatalogConfig, ConfigError};
