//! Network integration tests.
//!
//! These run complete sessions over real loopback sockets:
//! - Handshake and mesh formation over TCP
//! - A lockstep game over TCP

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Network test modules
mod network {
    pub mod tcp;
}
