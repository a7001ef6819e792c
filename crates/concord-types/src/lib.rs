//! Shared types for the Concord consensus transport.
//!
//! This crate holds the configuration surface and the top-level error type
//! used by the wire crate and by applications embedding it. It contains no
//! networking logic.

pub mod config;
pub mod error;

pub use config::{load_config, parse_config, WireConfig, MAX_MESSAGE_SIZE};
pub use error::{ConcordError, ConcordResult};
