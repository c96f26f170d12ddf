//! Typed property values and their wire encoding.
//!
//! The alternative order below is the wire format (§3/§4.C of the design
//! spec): the 16-bit tag written to disk is this enum's ordinal. Do not
//! reorder, insert, or remove variants without bumping the on-disk format --
//! the original C++ `Property.hpp` carries the same warning about its
//! `std::variant` alternative order.
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Blob(Vec<u8>),
}

impl PropertyValue {
    fn tag(&self) -> u16 {
        match self {
            PropertyValue::U8(_) => 0,
            PropertyValue::I8(_) => 1,
            PropertyValue::U16(_) => 2,
            PropertyValue::I16(_) => 3,
            PropertyValue::U32(_) => 4,
            PropertyValue::I32(_) => 5,
            PropertyValue::U64(_) => 6,
            PropertyValue::I64(_) => 7,
            PropertyValue::F32(_) => 8,
            PropertyValue::F64(_) => 9,
            PropertyValue::String(_) => 10,
            PropertyValue::Blob(_) => 11,
        }
    }

    /// Serializes `tag : u16` followed by the alternative's little-endian
    /// native bytes (strings/blobs prefixed by a `u64` length), per §4.C.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.tag().to_le_bytes())?;
        match self {
            PropertyValue::U8(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::I8(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::U16(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::I16(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::U32(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::I32(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::U64(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::I64(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::F32(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::F64(v) => w.write_all(&v.to_le_bytes()),
            PropertyValue::String(s) => {
                w.write_all(&(s.len() as u64).to_le_bytes())?;
                w.write_all(s.as_bytes())
            }
            PropertyValue::Blob(b) => {
                w.write_all(&(b.len() as u64).to_le_bytes())?;
                w.write_all(b)
            }
        }
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let tag = read_u16(r)?;
        Ok(match tag {
            0 => PropertyValue::U8(read_u8(r)?),
            1 => PropertyValue::I8(read_u8(r)? as i8),
            2 => PropertyValue::U16(read_u16(r)?),
            3 => PropertyValue::I16(read_u16(r)? as i16),
            4 => PropertyValue::U32(read_u32(r)?),
            5 => PropertyValue::I32(read_u32(r)? as i32),
            6 => PropertyValue::U64(read_u64(r)?),
            7 => PropertyValue::I64(read_u64(r)? as i64),
            8 => PropertyValue::F32(f32::from_le_bytes(read_u32(r)?.to_le_bytes())),
            9 => PropertyValue::F64(f64::from_le_bytes(read_u64(r)?.to_le_bytes())),
            10 => {
                let len = read_u64(r)? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf).map_err(Error::from)?;
                PropertyValue::String(String::from_utf8(buf).map_err(|e| Error::fatal(format!("invalid utf8 in property string: {e}")))?)
            }
            11 => {
                let len = read_u64(r)? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf).map_err(Error::from)?;
                PropertyValue::Blob(buf)
            }
            other => return Err(Error::fatal(format!("unknown property tag {other}"))),
        })
    }
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: PropertyValue) {
        let mut buf = Vec::new();
        v.encode(&mut buf).unwrap();
        let decoded = PropertyValue::decode(&mut &buf[..]).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn roundtrips_every_alternative() {
        roundtrip(PropertyValue::U8(7));
        roundtrip(PropertyValue::I8(-7));
        roundtrip(PropertyValue::U16(4242));
        roundtrip(PropertyValue::I16(-4242));
        roundtrip(PropertyValue::U32(42));
        roundtrip(PropertyValue::I32(-42));
        roundtrip(PropertyValue::U64(u64::MAX));
        roundtrip(PropertyValue::I64(i64::MIN));
        roundtrip(PropertyValue::F32(3.5));
        roundtrip(PropertyValue::F64(3.5));
        roundtrip(PropertyValue::String("hi".to_string()));
        roundtrip(PropertyValue::Blob(vec![1, 2, 3, 4]));
    }

    #[test]
    fn tags_are_stable_ordinals() {
        assert_eq!(PropertyValue::U8(0).tag(), 0);
        assert_eq!(PropertyValue::Blob(vec![]).tag(), 11);
    }
}
