//! Datagram packet layout and integrity hashing.
//!
//! Packet layout: bytes [0,4) carry the connection id, bytes [4,12) the
//! truncated integrity hash, bytes [12..) the sequenced payload. The hash is
//! a SHA-256 digest over payload‖secret, truncated to its first 8 bytes.

use log::warn;
use ring::digest;

use super::error::DatagramError;

/// Packets over this many bytes are dropped locally with a warning, never
/// sent fragmented.
pub const DATAGRAM_CEILING: usize = 1450;

/// Connection id (4) plus truncated hash (8).
pub const DATAGRAM_HEADER_SIZE: usize = 12;

const HASH_SIZE: usize = 8;

/// Stateless encoder/verifier for the datagram header. Sequencing lives in
/// [`DatagramSequencer`](super::sequencer::DatagramSequencer); this layer
/// only frames and authenticates.
pub struct DatagramCodec {
    connection_id: u32,
    secret: Vec<u8>,
}

impl DatagramCodec {
    pub fn new(connection_id: u32, secret: Vec<u8>) -> Self {
        Self {
            connection_id,
            secret,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Frames a sequenced payload into a transmittable packet. Oversized
    /// payloads are refused; the caller drops the message.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, DatagramError> {
        let size = DATAGRAM_HEADER_SIZE + payload.len();
        if size > DATAGRAM_CEILING {
            warn!(
                "Dropping oversized datagram [size={}, ceiling={}].",
                size, DATAGRAM_CEILING
            );
            return Err(DatagramError::Oversized {
                size,
                ceiling: DATAGRAM_CEILING,
            });
        }

        let mut packet = Vec::with_capacity(size);
        packet.extend_from_slice(&self.connection_id.to_be_bytes());
        packet.extend_from_slice(&self.truncated_hash(payload));
        packet.extend_from_slice(payload);
        Ok(packet)
    }

    /// Verifies an inbound packet and returns its sequenced payload.
    /// `None` means the packet did not pass (wrong connection, bad hash,
    /// truncated) and should be counted as a loss and skipped; inbound
    /// verification failures are never errors.
    pub fn decode<'p>(&self, packet: &'p [u8]) -> Option<&'p [u8]> {
        if packet.len() < DATAGRAM_HEADER_SIZE {
            return None;
        }
        let connection_id =
            u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if connection_id != self.connection_id {
            return None;
        }
        let payload = &packet[DATAGRAM_HEADER_SIZE..];
        if packet[4..DATAGRAM_HEADER_SIZE] != self.truncated_hash(payload) {
            return None;
        }
        Some(payload)
    }

    fn truncated_hash(&self, payload: &[u8]) -> [u8; HASH_SIZE] {
        let mut context = digest::Context::new(&digest::SHA256);
        context.update(payload);
        context.update(&self.secret);
        let full = context.finish();
        let mut truncated = [0u8; HASH_SIZE];
        truncated.copy_from_slice(&full.as_ref()[..HASH_SIZE]);
        truncated
    }
}
