//! Plugin contract and resolution for polydist.
//!
//! A distribution declares an ordered list of plugin references. This crate
//! turns those references into validated, loaded plugins bound to their
//! per-instance options: the capability trait plugins implement, the phase
//! contexts they receive, the per-run registry that loads each plugin once,
//! and the `@this` plugin that runs user scripts.

pub mod config;
pub mod context;
pub mod errors;
pub mod phase;
pub mod plugin;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod script;
pub mod testing;

pub use config::*;
pub use context::*;
pub use errors::*;
pub use phase::*;
pub use plugin::*;
pub use reference::*;
pub use registry::*;
pub use resolver::*;
pub use script::*;
pub use testing::{MockCallLog, MockOutcome, MockPlugin};
