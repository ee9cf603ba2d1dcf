use crate::serdes::{SerdesError, WireReader, WireWriter};

/// The closed set of value kinds that distributed object attributes, event
/// payloads and invocation arguments are built from.
#[derive(Debug, Clone, PartialEq)]
pub enum DValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<DValue>),
}

impl DValue {
    pub fn ser(&self, writer: &mut WireWriter) {
        match self {
            DValue::Bool(value) => {
                writer.write_u8(0);
                writer.write_bool(*value);
            }
            DValue::Int(value) => {
                writer.write_u8(1);
                writer.write_i32(*value);
            }
            DValue::Long(value) => {
                writer.write_u8(2);
                writer.write_i64(*value);
            }
            DValue::Str(value) => {
                writer.write_u8(3);
                writer.write_string(value);
            }
            DValue::Bytes(value) => {
                writer.write_u8(4);
                writer.write_bytes(value);
            }
            DValue::List(values) => {
                writer.write_u8(5);
                writer.write_u16(values.len() as u16);
                for value in values {
                    value.ser(writer);
                }
            }
        }
    }

    pub fn de(reader: &mut WireReader) -> Result<Self, SerdesError> {
        match reader.read_u8()? {
            0 => Ok(DValue::Bool(reader.read_bool()?)),
            1 => Ok(DValue::Int(reader.read_i32()?)),
            2 => Ok(DValue::Long(reader.read_i64()?)),
            3 => Ok(DValue::Str(reader.read_string()?)),
            4 => Ok(DValue::Bytes(reader.read_bytes()?)),
            5 => {
                let count = reader.read_u16()? as usize;
                let mut values = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    values.push(DValue::de(reader)?);
                }
                Ok(DValue::List(values))
            }
            tag => Err(SerdesError::UnknownTag {
                kind: "DValue",
                tag,
            }),
        }
    }
}

pub fn ser_values(values: &[DValue], writer: &mut WireWriter) {
    writer.write_u16(values.len() as u16);
    for value in values {
        value.ser(writer);
    }
}

pub fn de_values(reader: &mut WireReader) -> Result<Vec<DValue>, SerdesError> {
    let count = reader.read_u16()? as usize;
    let mut values = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        values.push(DValue::de(reader)?);
    }
    Ok(values)
}
