use crate::dobj::{DEvent, DObjectSnapshot};
use crate::serdes::{SerdesError, WireReader, WireWriter};
use crate::types::{ConnectionId, Oid};

use super::auth::AuthResponseData;

/// A pong response. `unpack_stamp` is not part of the wire image: it is
/// stamped by the receiver at decode time so that dispatch-queue latency does
/// not skew the clock-delta estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongResponse {
    /// Server clock reading at the moment the pong was packed (millis).
    pub pack_stamp: i64,
    /// Time the server spent between receiving the ping and packing the pong.
    pub process_delay: i64,
    /// Client clock reading at the moment the pong was unpacked (millis).
    pub unpack_stamp: i64,
}

/// Messages pushed from the server down to the client. Decoded at a single
/// point and matched exhaustively there.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamMessage {
    /// Answer to a secure-channel request. `server_key: None` means the
    /// server does not speak the secure exchange and the client should fall
    /// through to plain auth.
    SecureResponse { server_key: Option<Vec<u8>> },
    /// The one and only authentication answer.
    AuthResponse { data: AuthResponseData },
    /// Post-auth session startup data. Receipt of this flips the session
    /// "live".
    Bootstrap {
        connection_id: ConnectionId,
        client_oid: Oid,
        payload: Vec<u8>,
    },
    /// A server-applied event pushed to this subscriber.
    Event { event: DEvent },
    /// Successful answer to a subscribe request.
    ObjectResponse { object: DObjectSnapshot },
    /// Acknowledgment of an unsubscribe request.
    UnsubscribeResponse { oid: Oid },
    /// Failed answer to a subscribe request.
    FailureResponse { oid: Oid, reason: String },
    /// Answer to a ping.
    Pong(PongResponse),
    /// The server granted (or imposed) a new outgoing message rate.
    ThrottleUpdated { messages_per_sec: u32 },
}

impl DownstreamMessage {
    pub fn ser(&self, writer: &mut WireWriter) {
        match self {
            DownstreamMessage::SecureResponse { server_key } => {
                writer.write_u8(0);
                match server_key {
                    Some(key) => {
                        writer.write_bool(true);
                        writer.write_bytes(key);
                    }
                    None => writer.write_bool(false),
                }
            }
            DownstreamMessage::AuthResponse { data } => {
                writer.write_u8(1);
                data.ser(writer);
            }
            DownstreamMessage::Bootstrap {
                connection_id,
                client_oid,
                payload,
            } => {
                writer.write_u8(2);
                writer.write_u32(*connection_id);
                writer.write_i32(*client_oid);
                writer.write_bytes(payload);
            }
            DownstreamMessage::Event { event } => {
                writer.write_u8(3);
                event.ser(writer);
            }
            DownstreamMessage::ObjectResponse { object } => {
                writer.write_u8(4);
                object.ser(writer);
            }
            DownstreamMessage::UnsubscribeResponse { oid } => {
                writer.write_u8(5);
                writer.write_i32(*oid);
            }
            DownstreamMessage::FailureResponse { oid, reason } => {
                writer.write_u8(6);
                writer.write_i32(*oid);
                writer.write_string(reason);
            }
            DownstreamMessage::Pong(pong) => {
                writer.write_u8(7);
                writer.write_i64(pong.pack_stamp);
                writer.write_i64(pong.process_delay);
            }
            DownstreamMessage::ThrottleUpdated { messages_per_sec } => {
                writer.write_u8(8);
                writer.write_u32(*messages_per_sec);
            }
        }
    }

    /// Decodes a downstream message. `unpack_stamp` is the receiver's clock
    /// reading for this decode, recorded into pongs.
    pub fn de(reader: &mut WireReader, unpack_stamp: i64) -> Result<Self, SerdesError> {
        match reader.read_u8()? {
            0 => Ok(DownstreamMessage::SecureResponse {
                server_key: {
                    if reader.read_bool()? {
                        Some(reader.read_bytes()?)
                    } else {
                        None
                    }
                },
            }),
            1 => Ok(DownstreamMessage::AuthResponse {
                data: AuthResponseData::de(reader)?,
            }),
            2 => Ok(DownstreamMessage::Bootstrap {
                connection_id: reader.read_u32()?,
                client_oid: reader.read_i32()?,
                payload: reader.read_bytes()?,
            }),
            3 => Ok(DownstreamMessage::Event {
                event: DEvent::de(reader)?,
            }),
            4 => Ok(DownstreamMessage::ObjectResponse {
                object: DObjectSnapshot::de(reader)?,
            }),
            5 => Ok(DownstreamMessage::UnsubscribeResponse {
                oid: reader.read_i32()?,
            }),
            6 => Ok(DownstreamMessage::FailureResponse {
                oid: reader.read_i32()?,
                reason: reader.read_string()?,
            }),
            7 => Ok(DownstreamMessage::Pong(PongResponse {
                pack_stamp: reader.read_i64()?,
                process_delay: reader.read_i64()?,
                unpack_stamp,
            })),
            8 => Ok(DownstreamMessage::ThrottleUpdated {
                messages_per_sec: reader.read_u32()?,
            }),
            tag => Err(SerdesError::UnknownTag {
                kind: "DownstreamMessage",
                tag,
            }),
        }
    }
}
