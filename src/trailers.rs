//! Encoding of the trailer block carried by a trailers frame.
//!
//! The block is an HTTP/1-style header list: `key: value\r\n` per pair,
//! keys lowercase, order preserved, duplicate keys allowed. It must carry
//! `grpc-status`; binary values travel base64-encoded under `-bin` keys.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Encode `pairs` as a trailer block.
///
/// Keys are lowercased on the way out. Values containing CR or LF are
/// rejected with [`ProtocolError::InvalidMetadata`].
pub fn pack_trailers(pairs: &[(String, String)]) -> Result<Bytes, ProtocolError> {
    let mut block = BytesMut::new();

    for (key, value) in pairs {
        if value.contains(['\r', '\n']) {
            return Err(ProtocolError::InvalidMetadata(format!(
                "value for {} contains CR or LF",
                key
            )));
        }

        block.put_slice(key.to_ascii_lowercase().as_bytes());
        block.put_slice(b": ");
        block.put_slice(value.as_bytes());
        block.put_slice(b"\r\n");
    }

    Ok(block.freeze())
}

/// Decode a trailer block back into pairs.
///
/// Splits on `\r\n` (a terminating blank line is ignored), then each line
/// at its first `:`, trimming surrounding whitespace from the value. Order
/// and duplicate keys are preserved.
pub fn unpack_trailers(block: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::InvalidMetadata("trailer block is not UTF-8".to_owned()))?;

    let mut pairs = Vec::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or_else(|| {
            ProtocolError::InvalidMetadata(format!("trailer line without a colon: {}", line))
        })?;

        pairs.push((key.to_owned(), value.trim().to_owned()));
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trip_preserves_order_and_duplicates() {
        let input = pairs(&[
            ("grpc-status", "0"),
            ("x-envoy-attempt", "1"),
            ("x-envoy-attempt", "2"),
            ("x-trace-bin", "AAECAw=="),
        ]);

        let block = pack_trailers(&input).unwrap();
        assert_eq!(unpack_trailers(&block).unwrap(), input);
    }

    #[test]
    fn pack_lowercases_keys() {
        let block = pack_trailers(&pairs(&[("Grpc-Status", "0")])).unwrap();
        assert_eq!(&block[..], b"grpc-status: 0\r\n");
    }

    #[test]
    fn pack_rejects_cr_and_lf_in_values() {
        for value in ["sneaky\r\ninjection", "bare\rcr", "bare\nlf"] {
            assert!(matches!(
                pack_trailers(&pairs(&[("k", value)])),
                Err(ProtocolError::InvalidMetadata(_))
            ));
        }
    }

    #[test]
    fn unpack_trims_value_whitespace_and_splits_on_first_colon() {
        let decoded = unpack_trailers(b"grpc-message:  spaced out  \r\nk: a:b:c\r\n").unwrap();
        assert_eq!(
            decoded,
            pairs(&[("grpc-message", "spaced out"), ("k", "a:b:c")])
        );
    }

    #[test]
    fn unpack_ignores_terminating_blank_lines() {
        let decoded = unpack_trailers(b"grpc-status: 0\r\n\r\n").unwrap();
        assert_eq!(decoded, pairs(&[("grpc-status", "0")]));
        assert!(unpack_trailers(b"").unwrap().is_empty());
    }

    #[test]
    fn unpack_rejects_colonless_lines() {
        assert!(matches!(
            unpack_trailers(b"no colon here\r\n"),
            Err(ProtocolError::InvalidMetadata(_))
        ));
    }
}
