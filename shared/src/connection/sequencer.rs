//! Sequencing for the unreliable channel.
//!
//! Every outbound datagram is stamped with an increasing sequence number and
//! an acknowledgment of the highest sequence received so far. Inbound
//! datagrams at or below the last accepted sequence are rejected; delivery
//! to the application is strictly in increasing accepted order, with drops
//! accounted as misses, never reordered.

use crate::messages::downstream::DownstreamMessage;
use crate::messages::upstream::UpstreamMessage;
use crate::serdes::{SerdesError, WireReader, WireWriter};

/// A record of a sent datagram, retired once the peer acknowledges it.
#[derive(Debug, Clone, Copy)]
struct SendRecord {
    number: u32,
}

pub struct DatagramSequencer {
    /// The last sequence number written.
    last_number: u32,
    /// The most recent sequence number accepted.
    last_received: u32,
    /// Inbound packets dropped for failing verification or sequencing.
    missed: u64,
    /// Outbound datagrams the peer has acknowledged receiving.
    acknowledged: u64,
    send_records: Vec<SendRecord>,
}

impl DatagramSequencer {
    pub fn new() -> Self {
        Self {
            last_number: 0,
            last_received: 0,
            missed: 0,
            acknowledged: 0,
            send_records: Vec::new(),
        }
    }

    /// Serializes a message into a sequenced payload, stamping the next
    /// sequence number and the current acknowledgment.
    pub fn write_datagram(&mut self, message: &UpstreamMessage) -> Vec<u8> {
        self.last_number = self.last_number.wrapping_add(1);

        let mut writer = WireWriter::new();
        writer.write_u32(self.last_number);
        writer.write_u32(self.last_received);
        message.ser(&mut writer);

        self.send_records.push(SendRecord {
            number: self.last_number,
        });

        writer.into_bytes()
    }

    /// Decodes a sequenced payload. `Ok(None)` (distinguishable from an
    /// error) means the datagram arrived out of sequence and was dropped;
    /// the caller skips it silently. A decode error means the payload was
    /// unparseable, which is likewise dropped by the datagram path.
    pub fn read_datagram(
        &mut self,
        payload: &[u8],
        unpack_stamp: i64,
    ) -> Result<Option<DownstreamMessage>, SerdesError> {
        let mut reader = WireReader::new(payload);
        let number = reader.read_u32()?;
        if number <= self.last_received {
            // sequence regression: drop, but keep the loss statistics honest
            self.missed += 1;
            return Ok(None);
        }
        self.last_received = number;

        // retire send records up to the peer's acknowledgment
        let received = reader.read_u32()?;
        let retained = self
            .send_records
            .iter()
            .position(|record| record.number > received)
            .unwrap_or(self.send_records.len());
        self.acknowledged += retained as u64;
        self.send_records.drain(..retained);

        Ok(Some(DownstreamMessage::de(&mut reader, unpack_stamp)?))
    }

    /// Notes an inbound packet that failed verification before reaching the
    /// sequencer (bad hash, truncated header).
    pub fn note_failed(&mut self) {
        self.missed += 1;
    }

    /// Count of inbound datagrams dropped without delivery.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Count of outbound datagrams acknowledged by the peer.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    /// Outbound datagrams sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.send_records.len()
    }
}

impl Default for DatagramSequencer {
    fn default() -> Self {
        Self::new()
    }
}
