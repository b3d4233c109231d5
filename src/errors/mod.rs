//! # Error Handling
//!
//! Error types for the Switchyard control plane. Infrastructure failures use
//! [`Error`]; problems with individual configuration objects are collected in a
//! [`MultiError`] and surfaced through reports instead of being returned.

mod multi;
mod types;

pub use multi::MultiError;
pub use types::{Error, Result};
