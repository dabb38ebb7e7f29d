//! Raw TLV primitives for the Binary-IDL codec: LEB128 varints, the four
//! wire types, and tag read/write. This module knows nothing about
//! [`conduit_core::Schema`] -- it only turns bytes into `(tag, wire_type,
//! payload)` triples and back, the same layer real protobuf implementations
//! call the "wire format" (§4.3).

use conduit_core::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn bits(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }

    fn from_bits(bits: u64) -> Result<Self, RpcError> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            _ => Err(decode_error("unknown wire type")),
        }
    }
}

fn decode_error(message: &str) -> RpcError {
    RpcError::invalid_field("<wire>", message.to_string())
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64, RpcError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| decode_error("truncated varint"))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(decode_error("varint too long"));
        }
    }
}

pub fn write_tag(tag: u32, wire_type: WireType, out: &mut Vec<u8>) {
    encode_varint(((tag as u64) << 3) | wire_type.bits(), out);
}

pub fn read_tag(buf: &[u8], pos: &mut usize) -> Result<(u32, WireType), RpcError> {
    let v = decode_varint(buf, pos)?;
    let tag = u32::try_from(v >> 3).map_err(|_| decode_error("field tag overflow"))?;
    let wire_type = WireType::from_bits(v & 0x7)?;
    Ok((tag, wire_type))
}

pub fn write_length_delimited(tag: u32, payload: &[u8], out: &mut Vec<u8>) {
    write_tag(tag, WireType::LengthDelimited, out);
    encode_varint(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// One decoded `(tag, payload)` occurrence read off the wire, still in its
/// raw wire-type-specific form. A repeated or oneof field may see several of
/// these share a tag; scalar fields see at most one.
#[derive(Debug, Clone)]
pub enum RawValue {
    Varint(u64),
    Fixed64([u8; 8]),
    Fixed32([u8; 4]),
    LengthDelimited(Vec<u8>),
}

impl RawValue {
    pub fn as_length_delimited(&self) -> Result<&[u8], RpcError> {
        match self {
            RawValue::LengthDelimited(bytes) => Ok(bytes),
            _ => Err(decode_error("expected length-delimited field")),
        }
    }

    pub fn as_varint(&self) -> Result<u64, RpcError> {
        match self {
            RawValue::Varint(v) => Ok(*v),
            _ => Err(decode_error("expected varint field")),
        }
    }
}

/// Read every `(tag, wire_type)` pair in `bytes` into its raw value, without
/// yet knowing which logical type each tag corresponds to.
pub fn read_raw_fields(bytes: &[u8]) -> Result<Vec<(u32, RawValue)>, RpcError> {
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < bytes.len() {
        let (tag, wire_type) = read_tag(bytes, &mut pos)?;
        let value = match wire_type {
            WireType::Varint => RawValue::Varint(decode_varint(bytes, &mut pos)?),
            WireType::Fixed64 => {
                let slice = bytes
                    .get(pos..pos + 8)
                    .ok_or_else(|| decode_error("truncated fixed64"))?;
                pos += 8;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(slice);
                RawValue::Fixed64(buf)
            }
            WireType::Fixed32 => {
                let slice = bytes
                    .get(pos..pos + 4)
                    .ok_or_else(|| decode_error("truncated fixed32"))?;
                pos += 4;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(slice);
                RawValue::Fixed32(buf)
            }
            WireType::LengthDelimited => {
                let len = decode_varint(bytes, &mut pos)? as usize;
                let slice = bytes
                    .get(pos..pos + len)
                    .ok_or_else(|| decode_error("truncated length-delimited field"))?;
                pos += len;
                RawValue::LengthDelimited(slice.to_vec())
            }
        };
        out.push((tag, value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(v, &mut buf);
            let mut pos = 0;
            assert_eq!(decode_varint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn tag_round_trips() {
        let mut buf = Vec::new();
        write_tag(42, WireType::LengthDelimited, &mut buf);
        let mut pos = 0;
        let (tag, wt) = read_tag(&buf, &mut pos).unwrap();
        assert_eq!(tag, 42);
        assert_eq!(wt, WireType::LengthDelimited);
    }

    #[test]
    fn truncated_varint_is_invalid_argument() {
        let buf = [0x80u8];
        let mut pos = 0;
        assert!(decode_varint(&buf, &mut pos).is_err());
    }
}
