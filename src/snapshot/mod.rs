//! # Snapshot inputs
//!
//! [`Cache`] holds the latest value of every translation input;
//! [`Emitter`] keeps it current by running the watchers.

mod cache;
mod emitter;

pub use cache::Cache;
pub use emitter::{config_dependencies, Emitter, EmitterOutputs};
