//! Execution-graph builder, scheduler and orchestrator for polydist.
//!
//! Resolved plugins are expanded into one operation per
//! (distribution, plugin, phase), wired together by phase barriers, release
//! gating, declared dependencies and sequential-plugin ordering, and grouped
//! into waves. Waves run one after another; operations inside a wave run
//! concurrently. Raw operation results are folded back into one result per
//! distribution.

pub mod builder;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod graph;
pub mod orchestrator;
pub mod scheduler;

pub use builder::*;
pub use config::*;
pub use context::*;
pub use errors::*;
pub use events::*;
pub use graph::*;
pub use orchestrator::*;
pub use scheduler::*;
