//! PrintLink Settings Crate
//!
//! Loads, validates and saves the link configuration and turns it into the
//! runtime configuration of a printer link.

pub mod config;
pub mod error;

pub use config::{
    Config, PlannerSettings, QueueSettings, RecoverySettings, SerialSettings, WatchdogSettings,
};
pub use error::{SettingsError, SettingsResult};
