//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `test_utils`: an in-memory mesh of sessions plus polling and event helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{Mesh, MAX_POLL_ROUNDS};
//! ```

pub mod test_utils;

// Re-export commonly used items for convenience.
// Not every integration binary uses every helper.
#[allow(unused_imports)]
pub use test_utils::{
    chat_lines, count_matching, init_tracing, poll_with_sleep, Mesh, MAX_POLL_ROUNDS,
    POLL_INTERVAL,
};
