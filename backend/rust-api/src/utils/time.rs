use chrono::{DateTime, Utc};
use mongodb::bson::DateTime as BsonDateTime;

/// Millisecond-precision conversion for query filters and update documents.
/// Model fields go through the serde helpers instead.
pub fn chrono_to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_keeps_millisecond_precision() {
        let dt = DateTime::from_timestamp_millis(1_715_000_000_123).unwrap();
        assert_eq!(chrono_to_bson(dt).timestamp_millis(), 1_715_000_000_123);
    }

    #[test]
    fn conversion_handles_pre_epoch_times() {
        let dt = DateTime::from_timestamp_millis(-1_000).unwrap();
        assert_eq!(chrono_to_bson(dt).timestamp_millis(), -1_000);
    }
}
