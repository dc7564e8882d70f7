//! Core primitives for building supervision trees.
//!
//! Provides the [`Supervisable`][runtime::Supervisable] capability shared by every unit of work, the
//! [`Supervisor`][runtime::Supervisor] that drives children according to a restart strategy, the in-process
//! [generic server][gen_server] behavior, and the [process registry][registry].
#![deny(warnings)]
#![deny(missing_docs)]

pub mod collections;
pub mod gen_server;
pub mod registry;
pub mod runtime;
pub mod task;
