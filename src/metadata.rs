//! Call metadata: ordered key/value pairs attached to requests and
//! responses.
//!
//! Keys ending in `-bin` carry raw bytes, base64-encoded in transit;
//! every other key carries printable ASCII. The two shapes are kept apart
//! by [`MetadataValue`] so a handler never sees base64.

use bytes::Bytes;

use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::{alphabet, Engine};

use crate::error::ProtocolError;

/// Peers are inconsistent about padding `-bin` values, so decode either way.
pub(crate) const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const BINARY_SUFFIX: &str = "-bin";

/// A single metadata value, keyed on the `-bin` suffix convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable ASCII, carried verbatim.
    Ascii(String),
    /// Raw bytes, base64-encoded in transit under a `-bin` key.
    Binary(Bytes),
}

impl MetadataValue {
    /// The text form, if this is an ASCII value.
    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// The raw bytes, if this is a binary value.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Ascii(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' || b == b'.')
}

fn is_valid_ascii_value(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// An ordered multimap of call metadata.
///
/// Order is preserved and duplicate keys are allowed, as on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    /// An empty map.
    pub fn new() -> Self {
        Metadata::default()
    }

    /// Append an ASCII entry. The key is lowercased.
    ///
    /// Fails when the key is not a valid metadata key, carries the `-bin`
    /// suffix reserved for binary values, or the value is not printable
    /// ASCII.
    pub fn append_ascii(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let key = key.into().to_ascii_lowercase();
        let value = value.into();

        if !is_valid_key(&key) {
            return Err(ProtocolError::InvalidMetadata(format!(
                "invalid metadata key: {}",
                key
            )));
        }
        if key.ends_with(BINARY_SUFFIX) {
            return Err(ProtocolError::InvalidMetadata(format!(
                "ascii value under binary key: {}",
                key
            )));
        }
        if !is_valid_ascii_value(&value) {
            return Err(ProtocolError::InvalidMetadata(format!(
                "value for {} is not printable ascii",
                key
            )));
        }

        self.entries.push((key, MetadataValue::Ascii(value)));
        Ok(())
    }

    /// Append a binary entry. The key is lowercased and must end in `-bin`.
    pub fn append_binary(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<(), ProtocolError> {
        let key = key.into().to_ascii_lowercase();

        if !is_valid_key(&key) {
            return Err(ProtocolError::InvalidMetadata(format!(
                "invalid metadata key: {}",
                key
            )));
        }
        if !key.ends_with(BINARY_SUFFIX) {
            return Err(ProtocolError::InvalidMetadata(format!(
                "binary value under non-binary key: {}",
                key
            )));
        }

        self.entries.push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// Append an entry from its wire form, base64-decoding `-bin` keys.
    pub(crate) fn append_from_wire(&mut self, key: &str, raw: &[u8]) -> Result<(), ProtocolError> {
        let key = key.to_ascii_lowercase();

        if key.ends_with(BINARY_SUFFIX) {
            let decoded = BASE64.decode(raw).map_err(|err| {
                ProtocolError::InvalidMetadata(format!("bad base64 under {}: {}", key, err))
            })?;
            self.entries.push((key, MetadataValue::Binary(decoded.into())));
        } else {
            let value = std::str::from_utf8(raw)
                .map_err(|_| {
                    ProtocolError::InvalidMetadata(format!("value for {} is not ascii", key))
                })?
                .to_owned();
            self.entries.push((key, MetadataValue::Ascii(value)));
        }

        Ok(())
    }

    /// Wire form of every entry, binary values base64-encoded.
    pub fn to_wire_pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let wire = match value {
                    MetadataValue::Ascii(s) => s.clone(),
                    MetadataValue::Binary(b) => BASE64.encode(b),
                };
                (key.clone(), wire)
            })
            .collect()
    }

    /// First value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_entries_lowercase_keys() {
        let mut md = Metadata::new();
        md.append_ascii("X-Custom", "honk").unwrap();

        assert_eq!(
            md.get("x-custom").and_then(MetadataValue::as_ascii),
            Some("honk")
        );
        assert!(md.get("X-Custom").is_none());
    }

    #[test]
    fn binary_entries_round_trip_through_the_wire_form() {
        let mut md = Metadata::new();
        md.append_binary("x-trace-bin", &b"\x00\x01\x02\x03"[..])
            .unwrap();

        let pairs = md.to_wire_pairs();
        assert_eq!(pairs, [("x-trace-bin".to_owned(), "AAECAw==".to_owned())]);

        let mut decoded = Metadata::new();
        decoded
            .append_from_wire(&pairs[0].0, pairs[0].1.as_bytes())
            .unwrap();
        assert_eq!(
            decoded.get("x-trace-bin").and_then(MetadataValue::as_binary),
            Some(&b"\x00\x01\x02\x03"[..])
        );
    }

    #[test]
    fn unpadded_base64_decodes_too() {
        let mut md = Metadata::new();
        md.append_from_wire("x-trace-bin", b"AAECAw").unwrap();
        assert_eq!(
            md.get("x-trace-bin").and_then(MetadataValue::as_binary),
            Some(&b"\x00\x01\x02\x03"[..])
        );
    }

    #[test]
    fn suffix_and_value_shape_must_agree() {
        let mut md = Metadata::new();
        assert!(md.append_ascii("x-trace-bin", "text").is_err());
        assert!(md.append_binary("x-plain", &b"raw"[..]).is_err());
        assert!(md.append_ascii("", "v").is_err());
        assert!(md.append_ascii("x-ctl", "bad\x07value").is_err());
    }

    #[test]
    fn duplicates_and_order_are_preserved()  {
        let mut md = Metadata::new();
        md.append_ascii("k", "1").unwrap();
        md.append_ascii("j", "2").unwrap();
        md.append_ascii("k", "3").unwrap();

        let keys: Vec<_> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["k", "j", "k"]);
        assert_eq!(md.get("k").and_then(MetadataValue::as_ascii), Some("1"));
        assert_eq!(md.len(), 3);
    }
}
