use crate::dobj::DEvent;
use crate::serdes::{SerdesError, WireReader, WireWriter};
use crate::types::{ConnectionId, Oid};

use super::auth::Credentials;

/// Messages sent from the client up to the server. The set is closed; the
/// single outbound encode point matches it exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// Requests establishment of a secure channel prior to authentication.
    SecureRequest { client_key: Vec<u8> },
    /// Authenticates the session. `secret` is present when a secure channel
    /// was negotiated first.
    AuthRequest {
        credentials: Credentials,
        version: String,
        secret: Option<Vec<u8>>,
    },
    /// Requests subscription to the distributed object with this oid.
    Subscribe { oid: Oid },
    /// Withdraws this client's subscription to the object.
    Unsubscribe { oid: Oid },
    /// Forwards a locally generated event to the server for application.
    ForwardEvent { event: DEvent },
    /// Round-trip probe; also serves as a keep-alive.
    Ping,
    /// Informs the server that the datagram upgrade succeeded and it may
    /// start sending unreliable traffic for this connection id.
    TransmitDatagrams { connection_id: ConnectionId },
    /// Announces an orderly end of session.
    Logoff,
}

impl UpstreamMessage {
    pub fn ser(&self, writer: &mut WireWriter) {
        match self {
            UpstreamMessage::SecureRequest { client_key } => {
                writer.write_u8(0);
                writer.write_bytes(client_key);
            }
            UpstreamMessage::AuthRequest {
                credentials,
                version,
                secret,
            } => {
                writer.write_u8(1);
                credentials.ser(writer);
                writer.write_string(version);
                match secret {
                    Some(secret) => {
                        writer.write_bool(true);
                        writer.write_bytes(secret);
                    }
                    None => writer.write_bool(false),
                }
            }
            UpstreamMessage::Subscribe { oid } => {
                writer.write_u8(2);
                writer.write_i32(*oid);
            }
            UpstreamMessage::Unsubscribe { oid } => {
                writer.write_u8(3);
                writer.write_i32(*oid);
            }
            UpstreamMessage::ForwardEvent { event } => {
                writer.write_u8(4);
                event.ser(writer);
            }
            UpstreamMessage::Ping => {
                writer.write_u8(5);
            }
            UpstreamMessage::TransmitDatagrams { connection_id } => {
                writer.write_u8(6);
                writer.write_u32(*connection_id);
            }
            UpstreamMessage::Logoff => {
                writer.write_u8(7);
            }
        }
    }

    pub fn de(reader: &mut WireReader) -> Result<Self, SerdesError> {
        match reader.read_u8()? {
            0 => Ok(UpstreamMessage::SecureRequest {
                client_key: reader.read_bytes()?,
            }),
            1 => Ok(UpstreamMessage::AuthRequest {
                credentials: Credentials::de(reader)?,
                version: reader.read_string()?,
                secret: {
                    if reader.read_bool()? {
                        Some(reader.read_bytes()?)
                    } else {
                        None
                    }
                },
            }),
            2 => Ok(UpstreamMessage::Subscribe {
                oid: reader.read_i32()?,
            }),
            3 => Ok(UpstreamMessage::Unsubscribe {
                oid: reader.read_i32()?,
            }),
            4 => Ok(UpstreamMessage::ForwardEvent {
                event: DEvent::de(reader)?,
            }),
            5 => Ok(UpstreamMessage::Ping),
            6 => Ok(UpstreamMessage::TransmitDatagrams {
                connection_id: reader.read_u32()?,
            }),
            7 => Ok(UpstreamMessage::Logoff),
            tag => Err(SerdesError::UnknownTag {
                kind: "UpstreamMessage",
                tag,
            }),
        }
    }
}
