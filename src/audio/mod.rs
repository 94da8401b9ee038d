//! # Audio Intake
//!
//! Everything that happens to client audio before it leaves the relay.
//!
//! ## Key Components:
//! - **Frame Codec**: validates and splits the fixed-size binary frames
//! - **Audio Buffer**: per-session byte accumulator with a hard cap
//! - **Session Store**: tracks every live connection's buffer, flags and history
//! - **Audio Processor**: PCM cleanup used by the in-process pipeline
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz inbound, 24kHz synthesized (upsampled to 48kHz outbound)
//! - **Bit Depth**: 16-bit PCM, little-endian samples
//! - **Channels**: Mono

pub mod buffer;       // Capped byte accumulator
pub mod frame;        // Wire frame decoding
pub mod processor;    // Local preprocessing
pub mod session;      // Session state management
