//! # TurKV Configuration Module
//!
//! Numeric limits and defaults of the engine. Interdependent values live
//! together in [`constants`] and are checked at compile time.
//!
//! Runtime options (map size, durability, page size) are set per environment
//! through [`crate::EnvironmentBuilder`].

pub mod constants;
pub use constants::*;
