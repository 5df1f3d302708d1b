use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MailroomError;

/// Keyset cursor for `(created_at desc, id desc)` listings. Encoded as
/// url-safe base64 of `{"c": <rfc3339>, "i": <uuid>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub c: DateTime<Utc>,
    pub i: Uuid,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { c: created_at, i: id }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("cursor serializes");
        general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, MailroomError> {
        let bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| MailroomError::Validation("Malformed cursor".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| MailroomError::Validation("Malformed cursor".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cursor = Cursor::new(Utc::now(), Uuid::now_v7());
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(cursor, decoded);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Cursor::decode("not a cursor!!").is_err());
        assert!(Cursor::decode("aGVsbG8").is_err()); // valid base64, not json
    }
}
