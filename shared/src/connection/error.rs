use std::io;

use thiserror::Error;

use crate::serdes::SerdesError;

/// Errors raised by the reliable stream framing layer. Any of these is fatal
/// to the connection that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying stream failed
    #[error("stream i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream cleanly mid-session
    #[error("peer closed the connection")]
    PeerClosed,

    /// A frame header announced an implausible length
    #[error("frame length {length} exceeds maximum of {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// A complete frame failed to decode into a message
    #[error("undecodable frame: {0}")]
    Decode(#[from] SerdesError),
}

impl FrameError {
    /// Whether this is the peer hanging up rather than a genuine fault.
    /// Both lead to the same teardown; only logging differs.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, FrameError::PeerClosed)
    }
}

/// Errors raised by the datagram codec. Oversize is a local send-side error;
/// everything wrong with an inbound packet is reported as "no message", never
/// as an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatagramError {
    /// The payload would produce a packet over the transmit ceiling. The
    /// packet is dropped locally, never sent fragmented.
    #[error("datagram payload of {size} bytes exceeds ceiling of {ceiling}")]
    Oversized { size: usize, ceiling: usize },
}
