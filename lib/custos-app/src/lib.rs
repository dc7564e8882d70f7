//! High-level application primitives.
//!
//! This crate provides the pieces needed to bootstrap a process that hosts a supervision tree, or that runs as an
//! external worker underneath one, before any supervised work is started.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{initialize_logging, LoggingConfiguration, LoggingGuard};
}
