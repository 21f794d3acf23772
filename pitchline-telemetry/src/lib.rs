//! # pitchline-telemetry
//!
//! Structured logging for the bridge, the relay and the CLI.
//!
//! ## Usage
//!
//! ```rust
//! use pitchline_telemetry::{init_telemetry, info};
//!
//! init_telemetry("pitchline-relay");
//! info!(pair_id = 1, "relay pair opened");
//! ```

pub mod init;
pub mod spans;

// Re-export tracing macros for convenience
pub use tracing::{Span, debug, error, info, instrument, trace, warn};

pub use init::{init_json_telemetry, init_telemetry};
pub use spans::*;
