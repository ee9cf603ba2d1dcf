//! Distributed object events and snapshots.
//!
//! A distributed object is a server-authoritative record mirrored on
//! subscribed clients. All mutation flows as events: clients forward locally
//! generated events to the server, the server applies them and pushes applied
//! events back down to every subscriber.

use crate::serdes::{SerdesError, WireReader, WireWriter};
use crate::types::{Oid, ReceiverId, RequestId};
use crate::value::{de_values, ser_values, DValue};

/// The closed set of event kinds that can be applied to a distributed object.
#[derive(Debug, Clone, PartialEq)]
pub enum DEvent {
    /// A single attribute of the target object took on a new value.
    AttributeChanged {
        target_oid: Oid,
        name: String,
        value: DValue,
    },
    /// The target object ceased to exist; subscribers must drop their proxies.
    ObjectDestroyed { target_oid: Oid },
    /// A named, untyped notification associated with the target object.
    Message {
        target_oid: Oid,
        name: String,
        args: Vec<DValue>,
    },
    /// A batch of events applied atomically, in order, to one target object.
    Compound {
        target_oid: Oid,
        events: Vec<DEvent>,
    },
    /// A client-originated service call routed through the target object.
    InvocationRequest {
        target_oid: Oid,
        inv_code: i32,
        method_id: u8,
        request_id: Option<RequestId>,
        args: Vec<DValue>,
    },
    /// The server's answer to an invocation request, correlated by request id.
    InvocationResponse {
        target_oid: Oid,
        request_id: RequestId,
        method_id: u8,
        args: Vec<DValue>,
    },
    /// A server-initiated notification routed by registered receiver id.
    InvocationNotification {
        target_oid: Oid,
        receiver_id: ReceiverId,
        method_id: u8,
        args: Vec<DValue>,
    },
}

impl DEvent {
    /// The oid of the object this event is dispatched on.
    pub fn target_oid(&self) -> Oid {
        match self {
            DEvent::AttributeChanged { target_oid, .. }
            | DEvent::ObjectDestroyed { target_oid }
            | DEvent::Message { target_oid, .. }
            | DEvent::Compound { target_oid, .. }
            | DEvent::InvocationRequest { target_oid, .. }
            | DEvent::InvocationResponse { target_oid, .. }
            | DEvent::InvocationNotification { target_oid, .. } => *target_oid,
        }
    }

    pub fn ser(&self, writer: &mut WireWriter) {
        match self {
            DEvent::AttributeChanged {
                target_oid,
                name,
                value,
            } => {
                writer.write_u8(0);
                writer.write_i32(*target_oid);
                writer.write_string(name);
                value.ser(writer);
            }
            DEvent::ObjectDestroyed { target_oid } => {
                writer.write_u8(1);
                writer.write_i32(*target_oid);
            }
            DEvent::Message {
                target_oid,
                name,
                args,
            } => {
                writer.write_u8(2);
                writer.write_i32(*target_oid);
                writer.write_string(name);
                ser_values(args, writer);
            }
            DEvent::Compound { target_oid, events } => {
                writer.write_u8(3);
                writer.write_i32(*target_oid);
                writer.write_u16(events.len() as u16);
                for event in events {
                    event.ser(writer);
                }
            }
            DEvent::InvocationRequest {
                target_oid,
                inv_code,
                method_id,
                request_id,
                args,
            } => {
                writer.write_u8(4);
                writer.write_i32(*target_oid);
                writer.write_i32(*inv_code);
                writer.write_u8(*method_id);
                match request_id {
                    Some(id) => {
                        writer.write_bool(true);
                        writer.write_u16(*id);
                    }
                    None => writer.write_bool(false),
                }
                ser_values(args, writer);
            }
            DEvent::InvocationResponse {
                target_oid,
                request_id,
                method_id,
                args,
            } => {
                writer.write_u8(5);
                writer.write_i32(*target_oid);
                writer.write_u16(*request_id);
                writer.write_u8(*method_id);
                ser_values(args, writer);
            }
            DEvent::InvocationNotification {
                target_oid,
                receiver_id,
                method_id,
                args,
            } => {
                writer.write_u8(6);
                writer.write_i32(*target_oid);
                writer.write_u16(*receiver_id);
                writer.write_u8(*method_id);
                ser_values(args, writer);
            }
        }
    }

    pub fn de(reader: &mut WireReader) -> Result<Self, SerdesError> {
        match reader.read_u8()? {
            0 => Ok(DEvent::AttributeChanged {
                target_oid: reader.read_i32()?,
                name: reader.read_string()?,
                value: DValue::de(reader)?,
            }),
            1 => Ok(DEvent::ObjectDestroyed {
                target_oid: reader.read_i32()?,
            }),
            2 => Ok(DEvent::Message {
                target_oid: reader.read_i32()?,
                name: reader.read_string()?,
                args: de_values(reader)?,
            }),
            3 => {
                let target_oid = reader.read_i32()?;
                let count = reader.read_u16()? as usize;
                let mut events = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    events.push(DEvent::de(reader)?);
                }
                Ok(DEvent::Compound { target_oid, events })
            }
            4 => Ok(DEvent::InvocationRequest {
                target_oid: reader.read_i32()?,
                inv_code: reader.read_i32()?,
                method_id: reader.read_u8()?,
                request_id: {
                    if reader.read_bool()? {
                        Some(reader.read_u16()?)
                    } else {
                        None
                    }
                },
                args: de_values(reader)?,
            }),
            5 => Ok(DEvent::InvocationResponse {
                target_oid: reader.read_i32()?,
                request_id: reader.read_u16()?,
                method_id: reader.read_u8()?,
                args: de_values(reader)?,
            }),
            6 => Ok(DEvent::InvocationNotification {
                target_oid: reader.read_i32()?,
                receiver_id: reader.read_u16()?,
                method_id: reader.read_u8()?,
                args: de_values(reader)?,
            }),
            tag => Err(SerdesError::UnknownTag {
                kind: "DEvent",
                tag,
            }),
        }
    }
}

/// The server-side image of a distributed object as delivered in an
/// `ObjectResponse`: its oid, category (the key flush delays are registered
/// against, most-specific match walking `/`-separated segments) and attribute
/// set.
#[derive(Debug, Clone, PartialEq)]
pub struct DObjectSnapshot {
    pub oid: Oid,
    pub category: String,
    pub attributes: Vec<(String, DValue)>,
}

impl DObjectSnapshot {
    pub fn ser(&self, writer: &mut WireWriter) {
        writer.write_i32(self.oid);
        writer.write_string(&self.category);
        writer.write_u16(self.attributes.len() as u16);
        for (name, value) in &self.attributes {
            writer.write_string(name);
            value.ser(writer);
        }
    }

    pub fn de(reader: &mut WireReader) -> Result<Self, SerdesError> {
        let oid = reader.read_i32()?;
        let category = reader.read_string()?;
        let count = reader.read_u16()? as usize;
        let mut attributes = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = DValue::de(reader)?;
            attributes.push((name, value));
        }
        Ok(Self {
            oid,
            category,
            attributes,
        })
    }
}
