//! Activity monitoring module
//!
//! Classifies sessions as busy or idle from their output and fans state
//! changes out to notification subscribers.

mod activity;
mod hub;

pub use activity::*;
pub use hub::*;
