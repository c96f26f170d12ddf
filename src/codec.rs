//! Bit-exact serialization of an [`Entry`], per design spec §4.C.
//!
//! Wire order: `key`, `parent-key`, `name` (u64 length + bytes),
//! `property-count` + pairs, `child-count` + pairs, `expire-count` + pairs.
//! Everything is little-endian.

use std::io::{Read, Write};

use crate::entry::{Entry, Key};
use crate::error::{Error, Result};
use crate::property::PropertyValue;

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(Error::from)?;
    String::from_utf8(buf).map_err(|e| Error::fatal(format!("invalid utf8 in entry name/property: {e}")))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_key<R: Read>(r: &mut R) -> Result<Key> {
    read_u64(r)
}

/// Serializes `entry` into `buf`, appending to whatever is already there.
///
/// Performs write-side hygiene first: a clone with expired properties swept
/// is what actually gets serialized, so that read-back is observably equal
/// to write-side state (§4.C).
pub fn encode_entry<W: Write>(entry: &Entry, w: &mut W) -> std::io::Result<()> {
    let mut clean = entry.clone();
    clean.sweep_expired();

    w.write_all(&clean.key().to_le_bytes())?;
    w.write_all(&clean.parent().to_le_bytes())?;
    write_string(w, clean.name())?;

    let properties = clean.raw_properties();
    w.write_all(&(properties.len() as u64).to_le_bytes())?;
    for (name, value) in properties {
        write_string(w, name)?;
        value.encode(w)?;
    }

    let children: Vec<(&str, Key)> = clean.children().iter().collect();
    w.write_all(&(children.len() as u64).to_le_bytes())?;
    for (name, key) in children {
        write_string(w, name)?;
        w.write_all(&key.to_le_bytes())?;
    }

    let expirations = clean.raw_expirations();
    w.write_all(&(expirations.len() as u64).to_le_bytes())?;
    for (name, deadline) in expirations {
        write_string(w, name)?;
        w.write_all(&deadline.to_le_bytes())?;
    }

    Ok(())
}

pub fn encode_entry_to_vec(entry: &Entry) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_entry(entry, &mut buf)?;
    Ok(buf)
}

/// Deserializes an [`Entry`] from `r`, then runs the read-side expiration
/// sweep: any expiration whose deadline has already passed drops the
/// corresponding property, per §4.C.
pub fn decode_entry<R: Read>(r: &mut R) -> Result<Entry> {
    let key = read_key(r)?;
    let parent = read_key(r)?;
    let name = read_string(r)?;

    let mut entry = Entry::new(key, name);

    let property_count = read_u64(r)?;
    for _ in 0..property_count {
        let name = read_string(r)?;
        let value = PropertyValue::decode(r)?;
        entry.set_raw_property(name, value);
    }

    let child_count = read_u64(r)?;
    for _ in 0..child_count {
        let name = read_string(r)?;
        let child_key = read_key(r)?;
        entry.link_child_raw(name, child_key)?;
    }

    let expire_count = read_u64(r)?;
    for _ in 0..expire_count {
        let name = read_string(r)?;
        let deadline = read_i64(r)?;
        entry.set_raw_expiration(name, deadline);
    }

    entry.restore_parent(parent);
    entry.sweep_expired();

    Ok(entry)
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn decode_entry_from_slice(buf: &[u8]) -> Result<Entry> {
    decode_entry(&mut &buf[..])
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;
    use crate::entry::ROOT_KEY;

    fn arb_property_value() -> impl Strategy<Value = PropertyValue> {
        prop_oneof![
            any::<u8>().prop_map(PropertyValue::U8),
            any::<i8>().prop_map(PropertyValue::I8),
            any::<u16>().prop_map(PropertyValue::U16),
            any::<i16>().prop_map(PropertyValue::I16),
            any::<u32>().prop_map(PropertyValue::U32),
            any::<i32>().prop_map(PropertyValue::I32),
            any::<u64>().prop_map(PropertyValue::U64),
            any::<i64>().prop_map(PropertyValue::I64),
            any::<f32>().prop_map(PropertyValue::F32),
            any::<f64>().prop_map(PropertyValue::F64),
            "[a-z0-9]{0,32}".prop_map(PropertyValue::String),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(PropertyValue::Blob),
        ]
    }

    proptest! {
        /// Codec round-trip (§8.1): for every valid, non-expired entry `E`,
        /// `decode(encode(E)) == E`.
        #[test]
        fn codec_round_trips_arbitrary_properties(
            name in "[a-z]{1,16}",
            props in prop::collection::vec(("[a-z]{1,8}", arb_property_value()), 0..8),
        ) {
            let mut entry = Entry::new(ROOT_KEY, name);
            for (prop_name, value) in props {
                entry.set_property(prop_name, value);
            }

            let buf = encode_entry_to_vec(&entry).unwrap();
            let decoded = decode_entry_from_slice(&buf).unwrap();

            prop_assert_eq!(decoded.key(), entry.key());
            prop_assert_eq!(decoded.parent(), entry.parent());
            prop_assert_eq!(decoded.name(), entry.name());
            prop_assert_eq!(decoded.properties(), entry.properties());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::ROOT_KEY;

    #[test]
    fn round_trips_an_entry_with_properties_and_children() {
        let mut root = Entry::new(ROOT_KEY, "");
        root.set_property("s", PropertyValue::String("hi".into()));
        root.set_property("i", PropertyValue::U32(42));
        root.set_property("d", PropertyValue::F64(3.5));

        let mut dev = Entry::new(2, "dev");
        root.add_child(&mut dev).unwrap();

        let buf = encode_entry_to_vec(&root).unwrap();
        let decoded = decode_entry_from_slice(&buf).unwrap();

        assert_eq!(decoded.key(), root.key());
        assert_eq!(decoded.parent(), root.parent());
        assert_eq!(decoded.name(), root.name());
        assert_eq!(decoded.properties(), root.properties());
        assert_eq!(decoded.children().get("dev"), Some(2));
    }

    #[test]
    fn expired_properties_are_absent_on_both_sides() {
        let mut e = Entry::new(ROOT_KEY, "");
        e.set_property("p", PropertyValue::U8(1));
        e.expire_property("p", crate::entry::now_millis() - 1).unwrap();

        let buf = encode_entry_to_vec(&e).unwrap();
        let decoded = decode_entry_from_slice(&buf).unwrap();

        assert!(!decoded.has_property("p"));
        assert!(e.properties().is_empty());
    }
}
