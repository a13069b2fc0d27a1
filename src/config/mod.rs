//! Telemetry Configuration Module
//!
//! Buffer bounds, probe TTL, batch sizes, timeouts and purge policy loaded
//! from TOML, replacing hard-coded limits with tunable values.
//!
//! ## Loading Order
//!
//! 1. `TELEMETRY_SYNC_CONFIG` environment variable (path to TOML file)
//! 2. `telemetry_sync.toml` in the current working directory
//! 3. Built-in defaults (see `defaults`)
//!
//! ```ignore
//! let config = TelemetryConfig::load();
//! let hub = TelemetryHub::new(&config, store, perf_sink, crash_sink);
//! ```

mod telemetry_config;
pub mod defaults;
pub mod validation;

pub use telemetry_config::*;
