//! Configuration module
//!
//! Loads the gateway configuration from an optional TOML file.

mod gateway;

pub use gateway::*;
