//! Session integration tests.
//!
//! This module contains integration tests for complete sessions on the in-memory network:
//! - Join handshake: admission, denial and host loss
//! - Mesh formation and roster propagation
//! - Lockstep frames: convergence, stalls, divergence and timeouts
//! - Chat, direct messages and kicks

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod chat_kick;
    pub mod handshake;
    pub mod lockstep;
    pub mod mesh;
}
