//! Packet data model.
//!
//! A [`Packet`] is one application-level message: a UTF-8 command tag
//! followed by an ordered sequence of heterogeneous values. Packets are
//! immutable once constructed and are never mutated after being queued
//! for send.
//!
//! # Example
//!
//! ```
//! use sessionwire::packet::{Packet, PacketValue};
//!
//! let packet = Packet::new("echo", vec![PacketValue::from("hi")]);
//! assert_eq!(packet.tag(), "echo");
//! assert_eq!(packet.get_str(0), Some("hi"));
//! ```

use std::fmt;

use bytes::Bytes;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Reserved command tags, never forwarded to application handlers.
pub mod reserved {
    /// Ask the peer to stop its protocol loop.
    pub const STOP: &str = "stop";
    /// Ask the callee process to exit.
    pub const EXIT: &str = "exit";
    /// Emitted by a callee when it receives an OS termination signal.
    pub const SIGNAL: &str = "signal";
    /// Local notification: the connection was lost (EOF, I/O error, timeout).
    pub const CONNECTION_LOST: &str = "connection-lost";
    /// Local notification: malformed input was detected.
    pub const GIBBERISH: &str = "gibberish";

    /// Check whether a tag is reserved for control traffic.
    pub fn is_reserved(tag: &str) -> bool {
        matches!(tag, STOP | EXIT | SIGNAL | CONNECTION_LOST | GIBBERISH)
    }
}

/// One element of a packet.
///
/// Values may be integers, strings, byte blobs, nested sequences, or
/// mappings. Serialization maps each variant onto the natural type of the
/// negotiated encoding, so values round-trip through both MessagePack and
/// JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketValue {
    /// Signed integer.
    Int(i64),
    /// UTF-8 string.
    Text(String),
    /// Opaque byte blob (zero-copy via `bytes::Bytes`).
    Blob(Bytes),
    /// Nested ordered sequence.
    List(Vec<PacketValue>),
    /// Ordered mapping, insertion order preserved.
    Map(Vec<(PacketValue, PacketValue)>),
}

impl PacketValue {
    /// Get the value as a string slice, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PacketValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PacketValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the value as a byte slice, if it is a blob.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            PacketValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for PacketValue {
    fn from(v: i64) -> Self {
        PacketValue::Int(v)
    }
}

impl From<&str> for PacketValue {
    fn from(v: &str) -> Self {
        PacketValue::Text(v.to_string())
    }
}

impl From<String> for PacketValue {
    fn from(v: String) -> Self {
        PacketValue::Text(v)
    }
}

impl From<&[u8]> for PacketValue {
    fn from(v: &[u8]) -> Self {
        PacketValue::Blob(Bytes::copy_from_slice(v))
    }
}

impl From<Bytes> for PacketValue {
    fn from(v: Bytes) -> Self {
        PacketValue::Blob(v)
    }
}

impl Serialize for PacketValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PacketValue::Int(i) => serializer.serialize_i64(*i),
            PacketValue::Text(s) => serializer.serialize_str(s),
            PacketValue::Blob(b) => serializer.serialize_bytes(b),
            PacketValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            PacketValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = PacketValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer, string, byte blob, sequence or map")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<PacketValue, E> {
        Ok(PacketValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<PacketValue, E> {
        i64::try_from(v)
            .map(PacketValue::Int)
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<PacketValue, E> {
        Ok(PacketValue::Int(i64::from(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<PacketValue, E> {
        Ok(PacketValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<PacketValue, E> {
        Ok(PacketValue::Text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<PacketValue, E> {
        Ok(PacketValue::Blob(Bytes::copy_from_slice(v)))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<PacketValue, E> {
        Ok(PacketValue::Blob(Bytes::from(v)))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<PacketValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(PacketValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<PacketValue, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some(entry) = map.next_entry()? {
            entries.push(entry);
        }
        Ok(PacketValue::Map(entries))
    }
}

impl<'de> Deserialize<'de> for PacketValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// One application-level message: command tag plus ordered values.
///
/// Serialized as a flat sequence whose first element is the tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    tag: String,
    values: Vec<PacketValue>,
}

impl Packet {
    /// Create a new packet.
    pub fn new(tag: impl Into<String>, values: Vec<PacketValue>) -> Self {
        Self {
            tag: tag.into(),
            values,
        }
    }

    /// Create a packet with no values.
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self::new(tag, Vec::new())
    }

    /// The command tag (first wire element).
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The values following the tag.
    pub fn values(&self) -> &[PacketValue] {
        &self.values
    }

    /// Get value at `index` as a string slice.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(PacketValue::as_str)
    }

    /// Get value at `index` as an integer.
    pub fn get_int(&self, index: usize) -> Option<i64> {
        self.values.get(index).and_then(PacketValue::as_int)
    }

    /// Get value at `index` as a byte slice.
    pub fn get_blob(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(PacketValue::as_blob)
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1 + self.values.len()))?;
        seq.serialize_element(&self.tag)?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

struct PacketVisitor;

impl<'de> Visitor<'de> for PacketVisitor {
    type Value = Packet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sequence starting with a command tag")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Packet, A::Error> {
        let tag: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::custom("empty packet"))?;
        let mut values = Vec::new();
        while let Some(value) = seq.next_element()? {
            values.push(value);
        }
        Ok(Packet { tag, values })
    }
}

impl<'de> Deserialize<'de> for Packet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_seq(PacketVisitor)
    }
}

/// Build a printable excerpt of arbitrary bytes, at most `limit` characters.
///
/// Non-printable bytes are rendered as `.`, and truncated data gets a
/// trailing `..`. Used for `gibberish` notifications so that a corrupt
/// payload never floods the logs.
pub fn ellipsized(data: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(limit.min(data.len()) + 2);
    for &b in data.iter().take(limit) {
        if (0x20..0x7f).contains(&b) {
            out.push(b as char);
        } else {
            out.push('.');
        }
    }
    if data.len() > limit {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_accessors() {
        let packet = Packet::new(
            "move",
            vec![
                PacketValue::Int(10),
                PacketValue::from("window-1"),
                PacketValue::from(&b"\x01\x02"[..]),
            ],
        );
        assert_eq!(packet.tag(), "move");
        assert_eq!(packet.get_int(0), Some(10));
        assert_eq!(packet.get_str(1), Some("window-1"));
        assert_eq!(packet.get_blob(2), Some(&b"\x01\x02"[..]));
        assert_eq!(packet.get_str(0), None);
        assert_eq!(packet.get_int(5), None);
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let packet = Packet::new(
            "hello",
            vec![
                PacketValue::Int(-7),
                PacketValue::from("caps"),
                PacketValue::List(vec![PacketValue::Int(1), PacketValue::Int(2)]),
                PacketValue::Map(vec![(
                    PacketValue::from("key"),
                    PacketValue::from("value"),
                )]),
            ],
        );

        let bytes = rmp_serde::to_vec(&packet).unwrap();
        let decoded: Packet = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_json_roundtrip_without_blobs() {
        let packet = Packet::new("ping", vec![PacketValue::Int(123), PacketValue::from("x")]);
        let json = serde_json::to_string(&packet).unwrap();
        let decoded: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_blob_roundtrips_as_bytes_in_msgpack() {
        let packet = Packet::new("blob", vec![PacketValue::from(&[0u8, 1, 2, 255][..])]);
        let bytes = rmp_serde::to_vec(&packet).unwrap();
        let decoded: Packet = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.get_blob(0), Some(&[0u8, 1, 2, 255][..]));
    }

    #[test]
    fn test_empty_packet_rejected() {
        // A wire sequence with no tag is not a packet.
        let bytes = rmp_serde::to_vec(&Vec::<i32>::new()).unwrap();
        let result: Result<Packet, _> = rmp_serde::from_slice(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_reserved_tags() {
        assert!(reserved::is_reserved("stop"));
        assert!(reserved::is_reserved("gibberish"));
        assert!(reserved::is_reserved("connection-lost"));
        assert!(!reserved::is_reserved("echo"));
    }

    #[test]
    fn test_ellipsized_truncates() {
        let data = vec![b'a'; 200];
        let excerpt = ellipsized(&data, 80);
        assert_eq!(excerpt.len(), 82);
        assert!(excerpt.ends_with(".."));
    }

    #[test]
    fn test_ellipsized_masks_unprintable() {
        let excerpt = ellipsized(b"ok\x00\xff!", 80);
        assert_eq!(excerpt, "ok..!");
    }
}
