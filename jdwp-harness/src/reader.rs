// Helper functions for reading protocol data types from packet payloads
//
// A short payload inside a complete packet is a protocol error, not a
// "need more bytes" condition: framing has already delivered the whole packet.

use crate::protocol::{HarnessError, HarnessResult};
use crate::types::{Location, Tag, Value};
use bytes::Buf;

fn require(buf: &&[u8], n: usize, what: &str) -> HarnessResult<()> {
    if buf.remaining() < n {
        return Err(HarnessError::Protocol(format!(
            "Not enough data for {}: need {}, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> HarnessResult<String> {
    require(buf, 4, "string length")?;
    let len = buf.get_u32() as usize;
    require(buf, len, "string")?;

    let bytes = &buf[..len];
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|e| HarnessError::Protocol(format!("Invalid UTF-8 in string: {}", e)))?;
    buf.advance(len);
    Ok(s)
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> HarnessResult<u32> {
    require(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> HarnessResult<i32> {
    require(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> HarnessResult<u8> {
    require(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn read_bool(buf: &mut &[u8]) -> HarnessResult<bool> {
    Ok(read_u8(buf)? != 0)
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> HarnessResult<u64> {
    require(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

/// Read a location (type tag, class id, method id, index)
pub fn read_location(buf: &mut &[u8]) -> HarnessResult<Location> {
    Ok(Location {
        type_tag: read_u8(buf)?,
        class_id: read_u64(buf)?,
        method_id: read_u64(buf)?,
        index: read_u64(buf)?,
    })
}

/// Read a tagged value; an unrecognized tag is an error.
pub fn read_value(buf: &mut &[u8]) -> HarnessResult<Value> {
    let tag = Tag::try_from(read_u8(buf)?)?;
    read_untagged_value(tag, buf)
}

/// Read a value body whose tag is known from context.
pub fn read_untagged_value(tag: Tag, buf: &mut &[u8]) -> HarnessResult<Value> {
    let value = match tag {
        Tag::Byte => {
            require(buf, 1, "byte")?;
            Value::Byte(buf.get_i8())
        }
        Tag::Char => {
            require(buf, 2, "char")?;
            Value::Char(buf.get_u16())
        }
        Tag::Short => {
            require(buf, 2, "short")?;
            Value::Short(buf.get_i16())
        }
        Tag::Int => Value::Int(read_i32(buf)?),
        Tag::Long => {
            require(buf, 8, "long")?;
            Value::Long(buf.get_i64())
        }
        Tag::Float => {
            require(buf, 4, "float")?;
            Value::Float(buf.get_f32())
        }
        Tag::Double => {
            require(buf, 8, "double")?;
            Value::Double(buf.get_f64())
        }
        Tag::Boolean => Value::Boolean(read_bool(buf)?),
        Tag::Void => Value::Void,
        Tag::String => Value::String(read_string(buf)?),
        // Remaining tags are references: L, [, t, g, l, c
        tag => Value::Reference {
            tag,
            id: read_u64(buf)?,
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_string() {
        let data = [0, 0, 0, 3, b'a', b'b', b'c', 0xFF];
        let mut buf = &data[..];
        assert_eq!(read_string(&mut buf).unwrap(), "abc");
        assert_eq!(buf, &[0xFF]);
    }

    #[test]
    fn test_short_payload_is_protocol_error() {
        let data = [0, 0];
        let mut buf = &data[..];
        assert!(matches!(read_u32(&mut buf), Err(HarnessError::Protocol(_))));
    }

    #[test]
    fn test_read_tagged_values() {
        let mut data = Vec::new();
        Value::Long(-5).write_tagged(&mut data);
        Value::String("quit".to_string()).write_tagged(&mut data);
        Value::object(0x42).write_tagged(&mut data);
        Value::Double(1.5).write_tagged(&mut data);

        let mut buf = &data[..];
        assert_eq!(read_value(&mut buf).unwrap(), Value::Long(-5));
        assert_eq!(read_value(&mut buf).unwrap(), Value::String("quit".to_string()));
        assert_eq!(read_value(&mut buf).unwrap(), Value::object(0x42));
        assert_eq!(read_value(&mut buf).unwrap(), Value::Double(1.5));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let data = [b'Q', 0, 0, 0, 1];
        let mut buf = &data[..];
        assert!(matches!(
            read_value(&mut buf),
            Err(HarnessError::UnknownValueTag(b'Q'))
        ));
    }
}
