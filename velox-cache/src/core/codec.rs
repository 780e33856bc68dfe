//! Entry codec
//!
//! Payload layout:
//! - magic `VXC` (3 bytes)
//! - format version (u8)
//! - crc32 of the body (u32, little endian)
//! - body: MessagePack encoding of the [`Entry`]

use super::error::{CacheError, Result};
use super::types::{Entry, Value};
use serde::Deserialize;
use std::io::Cursor;

const MAGIC: &[u8; 3] = b"VXC";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Serialize an entry into a cache payload
pub fn encode(entry: &Entry) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(entry)?;
    let checksum = crc32fast::hash(&body);

    let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
    payload.extend_from_slice(MAGIC);
    payload.push(FORMAT_VERSION);
    payload.extend_from_slice(&checksum.to_le_bytes());
    payload.extend_from_slice(&body);

    Ok(payload)
}

/// Deserialize a cache payload back into an entry
pub fn decode(payload: &[u8]) -> Result<Entry> {
    if payload.len() < HEADER_LEN {
        return Err(CacheError::CorruptPayload(format!(
            "payload truncated: {} bytes, header needs {}",
            payload.len(),
            HEADER_LEN
        )));
    }

    let (header, body) = payload.split_at(HEADER_LEN);
    if &header[..MAGIC.len()] != MAGIC {
        return Err(CacheError::CorruptPayload("bad magic".to_string()));
    }

    let version = header[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(CacheError::CorruptPayload(format!(
            "unsupported format version {}",
            version
        )));
    }

    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&header[MAGIC.len() + 1..]);
    let expected = u32::from_le_bytes(checksum);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CacheError::CorruptPayload(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    let mut cursor = Cursor::new(body);
    let entry = Entry::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor))?;

    if cursor.position() != body.len() as u64 {
        return Err(CacheError::CorruptPayload(format!(
            "{} trailing bytes after entry",
            body.len() as u64 - cursor.position()
        )));
    }

    Ok(entry)
}

/// Encode a single cache value as a one-field entry keyed by `field`
pub fn encode_value(field: &str, value: Value) -> Result<Vec<u8>> {
    encode(&Entry::single(field, value))
}

/// Decode a payload written by [`encode_value`] under the same `field`
pub fn decode_value(field: &str, payload: &[u8]) -> Result<Value> {
    let mut entry = decode(payload)?;
    entry.remove(field).ok_or_else(|| {
        CacheError::CorruptPayload(format!("payload does not hold field {:?}", field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_entry() -> Entry {
        let mut nested = BTreeMap::new();
        nested.insert("enabled".to_string(), Value::Bool(true));
        nested.insert("ratio".to_string(), Value::Float(0.75));

        let mut entry = Entry::new();
        entry.insert("name", Value::from("bar"));
        entry.insert("count", Value::Int(-42));
        entry.insert("nothing", Value::Nil);
        entry.insert(
            "items",
            Value::Seq(vec![Value::Int(1), Value::from("two"), Value::Float(3.5)]),
        );
        entry.insert("settings", Value::Map(nested));
        entry
    }

    #[test]
    fn test_encode_decode() {
        let entry = Entry::single("foo", Value::from("bar"));

        let bytes = encode(&entry).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_roundtrip_nested_values() {
        let entry = sample_entry();
        let decoded = decode(&encode(&entry).unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_int_and_float_stay_distinct() {
        let mut entry = Entry::new();
        entry.insert("int", Value::Int(2));
        entry.insert("float", Value::Float(2.0));

        let decoded = decode(&encode(&entry).unwrap()).unwrap();
        assert_eq!(decoded.get("int"), Some(&Value::Int(2)));
        assert_eq!(decoded.get("float"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn test_empty_entry() {
        let entry = Entry::new();
        let decoded = decode(&encode(&entry).unwrap()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = decode(b"VX").unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_truncated_body() {
        let bytes = encode(&sample_entry()).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = encode(&sample_entry()).unwrap();
        bytes[0] = b'X';
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_unknown_version() {
        let mut bytes = encode(&sample_entry()).unwrap();
        bytes[3] = 9;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_flipped_body_byte() {
        let mut bytes = encode(&sample_entry()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_inconsistent_type_tags() {
        // Valid header and checksum around a body that is not an entry map
        let body = rmp_serde::to_vec(&42u32).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&body);

        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_value_roundtrip() {
        let payload = encode_value("app:foo", Value::from("bar")).unwrap();
        assert_eq!(decode_value("app:foo", &payload).unwrap(), Value::from("bar"));
    }

    #[test]
    fn test_decode_value_wrong_field() {
        let payload = encode_value("app:foo", Value::Int(1)).unwrap();
        let err = decode_value("app:other", &payload).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_trailing_garbage() {
        let entry = Entry::single("foo", Value::from("bar"));
        let mut body = rmp_serde::to_vec_named(&entry).unwrap();
        body.push(0xc0);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&body);

        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }
}
