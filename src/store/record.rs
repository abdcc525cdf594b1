use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field map of one document
pub type Fields = serde_json::Map<String, Value>;

pub const FIELD_TITLE: &str = "title";
pub const FIELD_IMAGE_URL: &str = "imageUrl";
pub const FIELD_START_DATE: &str = "startDate";
pub const FIELD_END_DATE: &str = "endDate";
pub const FIELD_IS_COMPLETED: &str = "isCompleted";
pub const FIELD_TIME_SPENT: &str = "timeSpent";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
pub const FIELD_OWNER_ID: &str = "ownerId";

/// A stored document: id plus its fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    /// Owner this document is scoped to
    pub fn owner(&self) -> Option<&str> {
        self.fields.get(FIELD_OWNER_ID).and_then(Value::as_str)
    }
}

/// Store-native point in time. Only the adapter converts it to chrono.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl StoreTimestamp {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Server time as the store itself would stamp it
    pub fn server_now(clock: &dyn Clock) -> Self {
        let now = clock.now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos())
    }

    pub fn to_value(self) -> Value {
        serde_json::json!({ "seconds": self.seconds, "nanos": self.nanos })
    }

    /// Parse the `{seconds, nanos}` encoding
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_timestamp_value_encoding() {
        let ts = StoreTimestamp::new(1_714_554_000, 250);
        let value = ts.to_value();
        assert_eq!(value["seconds"], 1_714_554_000);
        assert_eq!(value["nanos"], 250);
        assert_eq!(StoreTimestamp::from_value(&value), Some(ts));
    }

    #[test]
    fn test_timestamp_rejects_other_encodings() {
        assert_eq!(StoreTimestamp::from_value(&Value::Null), None);
        assert_eq!(StoreTimestamp::from_value(&Value::from("2024-05-01")), None);
        assert_eq!(StoreTimestamp::from_value(&serde_json::json!({ "seconds": 1 })), None);
    }

    #[test]
    fn test_server_now() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let ts = StoreTimestamp::server_now(&clock);
        assert_eq!(ts, StoreTimestamp::new(1_714_554_000, 0));
    }

    #[test]
    fn test_document_owner() {
        let mut fields = Fields::new();
        fields.insert(FIELD_OWNER_ID.to_string(), Value::from("alice"));
        let doc = Document {
            id: "d1".to_string(),
            fields,
        };
        assert_eq!(doc.owner(), Some("alice"));
    }
}
