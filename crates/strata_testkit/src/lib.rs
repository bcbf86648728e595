//! # Strata Testkit
//!
//! Test utilities for the Strata transaction core.
//!
//! This crate provides:
//! - Engine fixtures over memory and file logs
//! - Crash and restart simulation
//! - Property-based workload generators using proptest
//! - Test log output through `tracing-subscriber`
//!
//! ## Usage
//!
//! ```rust
//! use strata_testkit::prelude::*;
//!
//! let engine = TestEngine::new();
//! let key = engine.create_container();
//! engine.commit_row(key, 1, b"durable");
//!
//! let engine = engine.crash();
//! assert_eq!(engine.read_row(key, 1), Some(b"durable".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
