//! Document identifier wrappers for Corral.
//!
//! Every persisted entity is keyed by an [`IdRef`]: 12 raw bytes printed as
//! 24 lowercase hex characters. The first 4 bytes are the creation time in
//! unix seconds (big-endian), so freshly generated ids sort roughly by
//! insertion order; the remaining 8 bytes are random.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Raw length of an identifier in bytes.
pub const ID_RAW_LEN: usize = 12;

/// Length of the hex string representation.
pub const ID_HEX_LEN: usize = ID_RAW_LEN * 2;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

/// Opaque document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdRef([u8; ID_RAW_LEN]);

impl IdRef {
    /// Generate a fresh identifier: 4-byte unix-seconds prefix + 8 random bytes.
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut bytes = [0u8; ID_RAW_LEN];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[4..]);
        Self(bytes)
    }

    /// Parse a 24-character hex string into an identifier.
    ///
    /// Uppercase hex digits are accepted and normalized.
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        if value.len() != ID_HEX_LEN {
            return Err(IdParseError::new(format!(
                "Invalid identifier '{}': expected {} hex characters, got {}",
                value,
                ID_HEX_LEN,
                value.len()
            )));
        }

        let mut bytes = [0u8; ID_RAW_LEN];
        for (i, chunk) in value.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0]);
            let lo = hex_val(chunk[1]);
            match (hi, lo) {
                (Some(h), Some(l)) => bytes[i] = (h << 4) | l,
                _ => {
                    return Err(IdParseError::new(format!(
                        "Invalid identifier '{}': not a hex string",
                        value
                    )))
                }
            }
        }

        Ok(Self(bytes))
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_RAW_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; ID_RAW_LEN] {
        &self.0
    }

    /// Hex string representation (24 lowercase characters).
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(ID_HEX_LEN);
        for b in &self.0 {
            out.push(HEX_CHARS[(b >> 4) as usize] as char);
            out.push(HEX_CHARS[(b & 0x0f) as usize] as char);
        }
        out
    }

    /// Creation timestamp in unix seconds, taken from the id prefix.
    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for IdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for IdRef {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for IdRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        IdRef::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_roundtrip() {
        let id = IdRef::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), ID_HEX_LEN);
        assert_eq!(IdRef::parse(&hex).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(IdRef::parse("abc").is_err());
        assert!(IdRef::parse("").is_err());
        assert!(IdRef::parse(&"a".repeat(25)).is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(IdRef::parse("zzzzzzzzzzzzzzzzzzzzzzzz").is_err());
        assert!(IdRef::parse("0123456789abcdef0123456g").is_err());
    }

    #[test]
    fn test_parse_accepts_uppercase() {
        let id = IdRef::generate();
        let upper = id.to_hex().to_uppercase();
        assert_eq!(IdRef::parse(&upper).unwrap(), id);
    }

    #[test]
    fn test_ids_sort_by_creation_prefix() {
        let mut early = [0u8; ID_RAW_LEN];
        early[..4].copy_from_slice(&100u32.to_be_bytes());
        let mut late = [0u8; ID_RAW_LEN];
        late[..4].copy_from_slice(&200u32.to_be_bytes());

        let a = IdRef::from_bytes(early);
        let b = IdRef::from_bytes(late);
        assert!(a < b);
        assert_eq!(a.timestamp_secs(), 100);
    }

    #[test]
    fn test_serde_transparent_string() {
        let id = IdRef::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: IdRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
