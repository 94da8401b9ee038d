//! # Audio Frame Codec
//!
//! Parses the fixed-size binary frames the client streams over the socket.
//!
//! ## Wire Layout (big-endian header):
//! ```text
//! [timestamp: u32][flags: u32][payload: frame_samples * 2 bytes of 16-bit mono PCM]
//! ```
//! Bit 0 of `flags` tells the relay that synthesized speech is currently
//! playing on the client.
//!
//! The PCM payload is never interpreted here; it is an opaque byte span that
//! ends up in the session buffer untouched.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{RelayError, RelayResult};

/// Size of the `[timestamp][flags]` header.
pub const HEADER_BYTES: usize = 8;

/// Flag bit set while the client is playing synthesized audio.
pub const FLAG_TTS_PLAYING: u32 = 1;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Client-side capture timestamp
    pub timestamp: u32,
    /// Raw flag word
    pub flags: u32,
    /// PCM bytes, always `expected_size - HEADER_BYTES` long
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn tts_playing(&self) -> bool {
        self.flags & FLAG_TTS_PLAYING != 0
    }
}

/// Validating decoder for one protocol configuration.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    frame_samples: usize,
}

impl FrameCodec {
    pub fn new(frame_samples: usize) -> Self {
        Self { frame_samples }
    }

    /// Exact number of bytes a valid frame has on the wire.
    pub fn expected_size(&self) -> usize {
        HEADER_BYTES + self.payload_size()
    }

    pub fn payload_size(&self) -> usize {
        self.frame_samples * 2
    }

    /// Decode one frame.
    ///
    /// ## Errors:
    /// Any length other than [`expected_size`](Self::expected_size) is a
    /// `RelayError::Protocol`. The caller drops the frame and leaves the
    /// session untouched; it is never fatal for the connection.
    pub fn decode(&self, bytes: &[u8]) -> RelayResult<AudioFrame> {
        let expected = self.expected_size();
        if bytes.len() != expected {
            return Err(RelayError::Protocol {
                expected,
                actual: bytes.len(),
            });
        }

        let mut cursor = Cursor::new(&bytes[..HEADER_BYTES]);
        // The length check above guarantees the header is complete
        let timestamp = cursor.read_u32::<BigEndian>().map_err(|_| RelayError::Protocol {
            expected,
            actual: bytes.len(),
        })?;
        let flags = cursor.read_u32::<BigEndian>().map_err(|_| RelayError::Protocol {
            expected,
            actual: bytes.len(),
        })?;

        Ok(AudioFrame {
            timestamp,
            flags,
            payload: bytes[HEADER_BYTES..].to_vec(),
        })
    }
}
