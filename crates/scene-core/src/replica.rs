//! ReplicaId: identity of one running copy of a document (a tab, a peer,
//! a daemon process).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaIdError {
    #[error("Invalid replica ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
    #[error("Replica ID must not be zero")]
    Zero,
}

/// Identity stamped on outbound payloads and log lines.
///
/// Displays as a 16-character hex string.
///
/// # Examples
/// ```
/// use scene_core::ReplicaId;
///
/// let parsed: ReplicaId = "00000000000000ff".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xff);
/// assert_eq!(parsed.to_string(), "00000000000000ff");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Generate a new random replica ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ReplicaIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReplicaIdError::InvalidFormat);
        }
        match u64::from_str_radix(s, 16)? {
            0 => Err(ReplicaIdError::Zero),
            id => Ok(Self(id)),
        }
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Hex string on the wire, same as in logs
impl serde::Serialize for ReplicaId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ReplicaId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        assert_eq!(ReplicaId(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_mixed_case_hex() {
        let id: ReplicaId = "A1b2C3d4E5f67890".parse().unwrap();
        assert_eq!(id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_roundtrip() {
        let original = ReplicaId::generate();
        let parsed: ReplicaId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<ReplicaId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<ReplicaId>().is_err());
        assert!(matches!(
            "0000000000000000".parse::<ReplicaId>(),
            Err(ReplicaIdError::Zero)
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let id = ReplicaId(0xabc);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0000000000000abc\"");
        assert_eq!(serde_json::from_str::<ReplicaId>(&json).unwrap(), id);
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(ReplicaId::generate().as_u64(), 0);
        }
    }
}
