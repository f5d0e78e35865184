//! Text encodings for key material and packet traces.

/// Hex encoding/decoding. Decoding is deliberately permissive: any character
/// that is not a hex digit is skipped, remaining nibbles are paired in order
/// and a trailing unpaired nibble is discarded.
pub mod hex {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    #[inline]
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 0x0a),
            b'A'..=b'F' => Some(c - b'A' + 0x0a),
            _ => None,
        }
    }

    pub fn encode(data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len() * 2);
        for &byte in data {
            out.push(DIGITS[(byte >> 4) as usize] as char);
            out.push(DIGITS[(byte & 0x0f) as usize] as char);
        }
        out
    }

    pub fn decode(text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() / 2);
        let mut high: Option<u8> = None;
        for c in text.bytes() {
            let Some(n) = nibble(c) else { continue };
            match high.take() {
                Some(h) => out.push((h << 4) | n),
                None => high = Some(n),
            }
        }
        out
    }

    /// Strict fixed-size decode for key fields.
    pub fn decode_exact<const N: usize>(text: &str) -> Option<[u8; N]> {
        let raw = decode(text);
        let mut out = [0u8; N];
        if raw.len() != N {
            return None;
        }
        out.copy_from_slice(&raw);
        Some(out)
    }
}

/// Base64 helpers plus serde adapters for base64-encoded key fields.
pub mod base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    #[inline]
    pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(text)
    }

    pub fn serialize<S: Serializer>(bytes: impl AsRef<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = <&str>::deserialize(deserializer)?;
        decode(text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let data = [0x14, 0xfe, 0x26, 0x19, 0x54, 0x78, 0x00, 0x35, 0x19, 0xa9, 0x54, 0x4e, 0x99];
        let encoded = hex::encode(&data);
        assert_eq!(encoded, "14fe261954780035 19a9544e99".replace(' ', ""));
        assert_eq!(hex::decode(&encoded), data);
    }

    #[test]
    fn test_hex_decode_permissive() {
        // Non-hex characters are skipped; the trailing lone nibble is dropped.
        assert_eq!(hex::decode("x,F\nF1\t ,2\t~E "), vec![0xff, 0x12]);
        // "0x" prefixes are not special; the zeroes are parsed as digits.
        assert_eq!(hex::decode("0xFF 0x12 0xE"), vec![0x0f, 0xf0, 0x12, 0x0e]);
    }

    #[test]
    fn test_hex_decode_exact() {
        assert_eq!(hex::decode_exact::<2>("abcd"), Some([0xab, 0xcd]));
        assert_eq!(hex::decode_exact::<2>("abcdef"), None);
        assert_eq!(hex::decode_exact::<4>("abcd"), None);
    }

    #[test]
    fn test_base64_roundtrip() {
        let data = b"quantized datagrams";
        let encoded = base64::encode(data);
        assert_eq!(base64::decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_base64_decode_err() {
        assert!(base64::decode("!!not base64!!").is_err());
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct KeyField {
        #[serde(with = "super::base64")]
        key: Vec<u8>,
    }

    #[test]
    fn test_base64_serde_field_adapter() {
        let field = KeyField {
            key: vec![0x01, 0x02, 0xfe, 0xff],
        };
        let text = serde_json::to_string(&field).unwrap();
        assert!(text.contains(&base64::encode(&field.key)));

        let parsed: KeyField = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.key, field.key);

        assert!(serde_json::from_str::<KeyField>(r#"{"key":"!!bad!!"}"#).is_err());
    }
}
