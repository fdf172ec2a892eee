use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 20-byte SHA-1 value. Used for info hashes, piece hashes and peer ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Id20(pub [u8; 20]);

impl Id20 {
    pub const fn new(from: [u8; 20]) -> Self {
        Self(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl FromStr for Id20 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        if s.len() != 40 {
            anyhow::bail!("expected 40 hex characters, got {}", s.len());
        }
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

// Always hex, so ids read the same in JSON configs and logs.
impl Serialize for Id20 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let s = "a9993e364706816aba3e25717850c26c9cd0d89d";
        let id: Id20 = s.parse().unwrap();
        assert_eq!(id.0[0], 0xa9);
        assert_eq!(id.to_string(), s);
        assert_eq!(format!("{id:?}"), s);
        assert!("abcd".parse::<Id20>().is_err());
        assert!("zz993e364706816aba3e25717850c26c9cd0d89d".parse::<Id20>().is_err());
    }

    #[test]
    fn test_serde_json_is_hex() {
        let id = Id20::new([7u8; 20]);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", "07".repeat(20)));
        let back: Id20 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Id20>("\"0707\"").is_err());
    }
}
