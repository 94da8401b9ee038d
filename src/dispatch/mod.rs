//! # Dispatch
//!
//! Deciding when buffered audio leaves the relay, and making it so.
//!
//! - **policy**: pure threshold and idle rules
//! - **dispatcher**: per-frame evaluation, job startup and event forwarding
//! - **sweep**: periodic idle flush across all sessions

pub mod dispatcher;
pub mod policy;
pub mod sweep;
