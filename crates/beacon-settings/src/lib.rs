//! # beacon-settings
//!
//! Layered configuration for beacon live subscriptions.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BeaconSettings::default()`]
//! 2. **User file**: `~/.beacon/settings.json`, or `$BEACON_SETTINGS`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `BEACON_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{BeaconSettings, BroadcastSettings, LoggingSettings};
