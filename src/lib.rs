/*!
 * Bulwark - in-process fault tolerance
 *
 * Wires the pure-logic primitives of `bulwark-core-resilience` to the
 * outside world:
 * - TOML settings with shared and per-instance configuration
 * - Registries pre-populated from those settings
 * - Structured logging via `tracing-subscriber`
 * - Event telemetry that forwards every resilience event to `tracing`
 */

pub mod error;
pub mod logging;
pub mod settings;
pub mod telemetry;

// Re-export commonly used types
pub use bulwark_core_resilience as resilience;
pub use error::{BulwarkError, Result};
pub use settings::{Registries, Settings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
