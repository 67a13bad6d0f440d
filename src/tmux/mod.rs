//! Terminal multiplexer module
//!
//! Talks to tmux for session discovery, liveness and pane snapshots.

mod client;
#[cfg(test)]
pub mod fake;

pub use client::*;
