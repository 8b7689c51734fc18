use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A key-value record as seen by API callers.
///
/// `is_deleted` is the authoritative soft-delete marker; `deleted_at` is
/// present exactly when `is_deleted` is true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique, non-empty identifier. Immutable after creation.
    pub key: String,
    /// Stored payload.
    pub value: String,
    /// When the record was created (second resolution).
    pub created_at: DateTime<Utc>,
    /// When the record was last written (second resolution).
    pub updated_at: DateTime<Utc>,
    /// When the record was soft-deleted, if it currently is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Soft-delete flag.
    #[serde(default)]
    pub is_deleted: bool,
}

impl Record {
    /// Returns `true` if the record is visible to default reads and listings.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_secs;

    fn sample(deleted: bool) -> Record {
        let ts = from_unix_secs(1_700_000_000).unwrap();
        Record {
            key: "a".to_string(),
            value: "v1".to_string(),
            created_at: ts,
            updated_at: ts,
            deleted_at: deleted.then_some(ts),
            is_deleted: deleted,
        }
    }

    #[test]
    fn live_record_omits_deleted_at() {
        let json = serde_json::to_value(sample(false)).unwrap();
        assert_eq!(json["key"], "a");
        assert_eq!(json["value"], "v1");
        assert_eq!(json["is_deleted"], false);
        assert!(json.get("deleted_at").is_none());
        assert_eq!(json["created_at"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn deleted_record_carries_deleted_at() {
        let record = sample(true);
        assert!(!record.is_live());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["is_deleted"], true);
        assert_eq!(json["deleted_at"], "2023-11-14T22:13:20Z");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
