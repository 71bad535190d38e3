//! Length-prefixed binary frame codec
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! u32  payload length (bytes following this field)
//! u32  command code
//! u64  sequence
//! u64  reply sequence (0 = unsolicited)
//! u16  field count
//!      per field:
//!        u16  key length, key bytes (UTF-8)
//!        u8   value tag
//!        ...  tag-dependent value payload
//! ```
//!
//! The layout is internal to this transport; peers agree on it by running
//! the same stack, not by an external wire contract.

use bytes::{Buf, BufMut, BytesMut};
use scadalink_core::{LinkError, LinkResult, Message, Value};

/// Upper bound for one frame's payload, guards against corrupt length fields
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

const TAG_VOID: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;

/// Encode a message into a complete frame, length prefix included
pub fn encode_frame(message: &Message) -> LinkResult<BytesMut> {
    let mut payload = BytesMut::with_capacity(64);
    payload.put_u32(message.command_code());
    payload.put_u64(message.sequence());
    payload.put_u64(message.reply_sequence());

    let values = message.values();
    if values.len() > u16::MAX as usize {
        return Err(LinkError::InvalidData(format!(
            "Too many message fields: {}",
            values.len()
        )));
    }
    payload.put_u16(values.len() as u16);

    for (key, value) in values {
        if key.len() > u16::MAX as usize {
            return Err(LinkError::InvalidData(format!(
                "Field name too long: {} bytes",
                key.len()
            )));
        }
        payload.put_u16(key.len() as u16);
        payload.put_slice(key.as_bytes());
        match value {
            Value::Void => payload.put_u8(TAG_VOID),
            Value::Boolean(v) => {
                payload.put_u8(TAG_BOOLEAN);
                payload.put_u8(u8::from(*v));
            }
            Value::Integer(v) => {
                payload.put_u8(TAG_INTEGER);
                payload.put_i32(*v);
            }
            Value::Long(v) => {
                payload.put_u8(TAG_LONG);
                payload.put_i64(*v);
            }
            Value::Double(v) => {
                payload.put_u8(TAG_DOUBLE);
                payload.put_f64(*v);
            }
            Value::String(v) => {
                payload.put_u8(TAG_STRING);
                payload.put_u32(v.len() as u32);
                payload.put_slice(v.as_bytes());
            }
        }
    }

    if payload.len() > MAX_FRAME_LENGTH {
        return Err(LinkError::InvalidData(format!(
            "Frame payload too large: {} bytes",
            payload.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(payload.len() + 4);
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn need(buf: &impl Buf, n: usize, what: &str) -> LinkResult<()> {
    if buf.remaining() < n {
        return Err(LinkError::InvalidData(format!(
            "Frame truncated reading {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_string(buf: &mut &[u8], len: usize, what: &str) -> LinkResult<String> {
    need(buf, len, what)?;
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw)
        .map_err(|e| LinkError::InvalidData(format!("Invalid UTF-8 in {}: {}", what, e)))
}

/// Decode one frame payload (the bytes following the length prefix)
pub fn decode_payload(mut buf: &[u8]) -> LinkResult<Message> {
    need(&buf, 4 + 8 + 8 + 2, "frame header")?;
    let command_code = buf.get_u32();
    let sequence = buf.get_u64();
    let reply_sequence = buf.get_u64();
    let field_count = buf.get_u16();

    let mut message = Message::from_parts(command_code, sequence, reply_sequence);
    for _ in 0..field_count {
        need(&buf, 2, "field name length")?;
        let key_len = buf.get_u16() as usize;
        let key = get_string(&mut buf, key_len, "field name")?;

        need(&buf, 1, "value tag")?;
        let value = match buf.get_u8() {
            TAG_VOID => Value::Void,
            TAG_BOOLEAN => {
                need(&buf, 1, "boolean value")?;
                Value::Boolean(buf.get_u8() != 0)
            }
            TAG_INTEGER => {
                need(&buf, 4, "integer value")?;
                Value::Integer(buf.get_i32())
            }
            TAG_LONG => {
                need(&buf, 8, "long value")?;
                Value::Long(buf.get_i64())
            }
            TAG_DOUBLE => {
                need(&buf, 8, "double value")?;
                Value::Double(buf.get_f64())
            }
            TAG_STRING => {
                need(&buf, 4, "string length")?;
                let len = buf.get_u32() as usize;
                if len > MAX_FRAME_LENGTH {
                    return Err(LinkError::InvalidData(format!(
                        "String value too large: {} bytes",
                        len
                    )));
                }
                Value::String(get_string(&mut buf, len, "string value")?)
            }
            tag => {
                return Err(LinkError::InvalidData(format!(
                    "Unknown value tag: 0x{:02X}",
                    tag
                )));
            }
        };
        message.set_field(&key, value);
    }

    if buf.has_remaining() {
        return Err(LinkError::InvalidData(format!(
            "Trailing garbage in frame: {} bytes",
            buf.remaining()
        )));
    }
    Ok(message)
}
