use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Value stored under a held lock's key.
///
/// Timestamps are seconds since the Unix epoch. A record without `expires`
/// counts as expired. A value that does not parse is not a record at all and
/// is left alone.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LockRecord {
    /// When the record was written.
    pub time_set: f64,

    /// When the lock stops being valid unless refreshed.
    #[serde(default)]
    pub expires: Option<f64>,

    /// Identifier of the holding lock instance.
    pub id: String,
}

impl LockRecord {
    /// A fresh record for `id`, valid for `expiration` from now.
    #[must_use]
    pub fn new(id: &str, expiration: Duration) -> Self {
        let now = now();
        Self {
            time_set: now,
            expires: Some(now + expiration.as_secs_f64()),
            id: id.to_string(),
        }
    }

    /// Parses a stored record.
    #[must_use]
    pub fn parse(value: &[u8]) -> Option<Self> {
        serde_json::from_slice(value).ok()
    }

    /// Whether the record is past its expiration at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: f64) -> bool {
        self.expires.is_none_or(|expires| expires < now)
    }

    pub(crate) fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_format() {
        let record = LockRecord::new("owner", Duration::from_secs(60));
        let value: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();

        assert_eq!(value["id"], "owner");
        assert!(value["expires"].as_f64().unwrap() > value["time_set"].as_f64().unwrap());
        assert!(!record.is_expired_at(now()));
    }

    #[test]
    fn test_expiration_rules() {
        let expired = |value: &[u8]| LockRecord::parse(value).unwrap().is_expired_at(now());
        assert!(expired(br#"{"time_set": 1.0, "expires": 2.0, "id": "x"}"#));
        assert!(expired(br#"{"time_set": 1.0, "id": "x"}"#));
        assert!(LockRecord::parse(b"not json").is_none());

        let future = now() + 100.0;
        let value = format!(r#"{{"time_set": 1.0, "expires": {future}, "id": "x"}}"#);
        assert!(!expired(value.as_bytes()));
    }
}
