use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of a bucket listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            key: key.into(),
            modified,
            size,
        }
    }
}

/// An object modified strictly after the checkpoint in effect when it was
/// scanned. Serializes to the invocation payload `{bucket, key, modified}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredObject {
    pub bucket: String,
    pub key: String,
    pub modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_shape() {
        let object = DiscoveredObject {
            bucket: "uploads".into(),
            key: "photo.jpg".into(),
            modified: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap(),
        };
        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(value["bucket"], "uploads");
        assert_eq!(value["key"], "photo.jpg");
        assert_eq!(value["modified"], "2024-05-01T10:00:01Z");
        assert_eq!(value.as_object().unwrap().len(), 3);
    }
}
