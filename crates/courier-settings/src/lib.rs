//! # courier-settings
//!
//! Layered configuration for the Courier broker.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`CourierSettings::default()`])
//! 2. **User file** at `~/.courier/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** (`COURIER_*`, highest priority)
//!
//! There is no process-wide settings instance. The host loads settings once
//! and hands them to the broker it spawns.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    load_with_env, settings_path,
};
pub use types::{BrokerSettings, CourierSettings, LoggingSettings};
