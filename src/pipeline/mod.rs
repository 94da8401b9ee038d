//! # Pipeline
//!
//! The stage model shared by every backend, plus the in-process pipeline
//! used when the relay runs recognition, response and synthesis itself.

pub mod events;
pub mod orchestrator;
pub mod stages;
pub mod synthesis;
pub mod upsample;
