use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Length of every [`EntityId`] in characters.
pub const ENTITY_ID_LEN: usize = 26;

// Crockford base32: no I, L, O, U so ids survive being read aloud or retyped.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Lexicographically sortable 26-character identifier.
///
/// Generated ids are the 128 bits of a UUIDv7 rendered as Crockford base32, so the
/// leading characters carry the millisecond timestamp and later ids sort after earlier
/// ones. Parsed ids only need to be 26 ASCII alphanumerics, which keeps ids minted by
/// other systems (ULIDs, for example) usable as job targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new() -> Self {
        Self(encode_crockford(Uuid::now_v7().as_u128()))
    }

    /// Validate `value` as an identifier.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != ENTITY_ID_LEN {
            return Err(CoreError::InvalidId {
                value: value.to_string(),
                reason: format!("expected {ENTITY_ID_LEN} characters, got {}", value.len()),
            });
        }
        if !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidId {
                value: value.to_string(),
                reason: "only ASCII letters and digits are allowed".to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn encode_crockford(mut value: u128) -> String {
    let mut out = [0u8; ENTITY_ID_LEN];
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(value & 0x1f) as usize];
        value >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for EntityId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl std::str::FromStr for EntityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_26_crockford_chars() {
        let id = EntityId::new();
        assert_eq!(id.as_str().len(), ENTITY_ID_LEN);
        assert!(id.as_str().bytes().all(|b| CROCKFORD.contains(&b)));
        assert!(EntityId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = EntityId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EntityId::new();
        assert!(first < second);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let err = EntityId::parse("01HX").unwrap_err();
        assert_eq!(err.code(), "INVALID_ID");
    }

    #[test]
    fn parse_rejects_non_alphanumeric() {
        assert!(EntityId::parse("01HXZ3-4Q7N8M2K5V9P0R1S2T3").is_err());
    }

    #[test]
    fn deserialize_validates() {
        let ok: EntityId = serde_json::from_str(r#""01HXZ34Q7N8M2K5V9P0R1S2T3W""#).unwrap();
        assert_eq!(ok.as_str(), "01HXZ34Q7N8M2K5V9P0R1S2T3W");
        assert!(serde_json::from_str::<EntityId>(r#""short""#).is_err());
    }

    #[test]
    fn encoding_is_fixed_width() {
        assert_eq!(encode_crockford(0), "0".repeat(ENTITY_ID_LEN));
        assert_eq!(encode_crockford(u128::MAX), format!("7{}", "Z".repeat(25)));
    }
}
