//! Length-prefixed framing for the reliable stream channel.
//!
//! Wire format: 4-byte big-endian body length, then the opaque serialized
//! message body. Partial frames are never surfaced: the reader accumulates
//! bytes until a whole frame is present, the writer emits whole frames only.

use std::io::{Read, Write};

use crate::messages::downstream::DownstreamMessage;
use crate::messages::upstream::UpstreamMessage;
use crate::serdes::{WireReader, WireWriter};

use super::error::FrameError;

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME_SIZE: usize = 1 << 24;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Serializes messages and writes them as length-prefixed frames. The framing
/// buffer is reset after every send, success or failure, so one failed write
/// cannot corrupt the next frame.
pub struct FrameWriter {
    buffer: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_message<W: Write>(
        &mut self,
        sink: &mut W,
        message: &UpstreamMessage,
    ) -> Result<(), FrameError> {
        let result = self.frame_and_send(sink, message);
        self.buffer.clear();
        result
    }

    fn frame_and_send<W: Write>(
        &mut self,
        sink: &mut W,
        message: &UpstreamMessage,
    ) -> Result<(), FrameError> {
        // serialize first so we know the length to prefix
        let mut body = WireWriter::new();
        message.ser(&mut body);
        let body = body.into_bytes();

        self.buffer.clear();
        self.buffer
            .extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.buffer.extend_from_slice(&body);

        sink.write_all(&self.buffer)?;
        sink.flush()?;
        Ok(())
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates stream bytes and yields complete frames. Decode is
/// all-or-nothing: a frame is either wholly present or nothing is returned.
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends raw stream bytes to the accumulation buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete frame body, or `None` if more data is
    /// needed. Call again after feeding more bytes.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                length,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }
        let body = self.buffer[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length].to_vec();
        self.buffer.drain(..LENGTH_PREFIX_SIZE + length);
        Ok(Some(body))
    }

    /// Blocks on the source until one complete frame has been read.
    /// A zero-length read is the peer closing the stream.
    pub fn read_frame<R: Read>(&mut self, source: &mut R) -> Result<Vec<u8>, FrameError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(frame);
            }
            let count = source.read(&mut chunk)?;
            if count == 0 {
                return Err(FrameError::PeerClosed);
            }
            self.feed(&chunk[..count]);
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes one complete frame body into a downstream message.
/// `unpack_stamp` is the receiver clock reading recorded into pongs.
pub fn decode_downstream(frame: &[u8], unpack_stamp: i64) -> Result<DownstreamMessage, FrameError> {
    let mut reader = WireReader::new(frame);
    Ok(DownstreamMessage::de(&mut reader, unpack_stamp)?)
}

/// Decodes one complete frame body into an upstream message, for the
/// server-side counterpart and for round-trip tests.
pub fn decode_upstream(frame: &[u8]) -> Result<UpstreamMessage, FrameError> {
    let mut reader = WireReader::new(frame);
    Ok(UpstreamMessage::de(&mut reader)?)
}
