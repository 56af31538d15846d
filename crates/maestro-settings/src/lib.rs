//! Layered configuration for the maestro engine.
//!
//! Settings are plain values handed to constructors by the binary; there is
//! no process-wide settings singleton.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{MaestroSettings, MetricsBackend, MetricsSettings};
