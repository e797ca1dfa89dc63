use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Field carrying the correlation key in both streams.
pub const CORRELATION_FIELD: &str = "id";

/// Which of the two joined streams an event was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSide {
    Customer,
    Inventory,
}

impl StreamSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSide::Customer => "customer",
            StreamSide::Inventory => "inventory",
        }
    }

    pub fn other(&self) -> StreamSide {
        match self {
            StreamSide::Customer => StreamSide::Inventory,
            StreamSide::Inventory => StreamSide::Customer,
        }
    }
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic names for the two joined streams.
#[derive(Debug, Clone)]
pub struct StreamTopics {
    pub customer: String,
    pub inventory: String,
}

impl StreamTopics {
    pub fn new(customer: impl Into<String>, inventory: impl Into<String>) -> Self {
        Self {
            customer: customer.into(),
            inventory: inventory.into(),
        }
    }

    pub fn side_for(&self, topic: &str) -> Option<StreamSide> {
        if topic == self.customer {
            Some(StreamSide::Customer)
        } else if topic == self.inventory {
            Some(StreamSide::Inventory)
        } else {
            None
        }
    }

    pub fn names(&self) -> [&str; 2] {
        [&self.customer, &self.inventory]
    }
}

/// One message read from either stream, exactly as the broker handed it to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub side: StreamSide,
    pub raw_payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

impl InboundEvent {
    pub fn new(
        side: StreamSide,
        raw_payload: impl Into<Vec<u8>>,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            side,
            raw_payload: raw_payload.into(),
            partition,
            offset,
        }
    }

    /// Decode the raw payload into a half record.
    ///
    /// The payload must be a JSON object whose `id` field is a non-empty string or an integer.
    pub fn decode(&self) -> Result<HalfRecord, DecodeError> {
        if self.raw_payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        let payload: Value = serde_json::from_slice(&self.raw_payload)?;
        let Some(fields) = payload.as_object() else {
            return Err(DecodeError::NotAnObject);
        };

        let correlation_key = match fields.get(CORRELATION_FIELD) {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            Some(Value::Number(key)) if key.is_i64() || key.is_u64() => key.to_string(),
            _ => return Err(DecodeError::MissingCorrelationKey),
        };

        Ok(HalfRecord {
            correlation_key,
            side: self.side,
            payload,
        })
    }
}

/// One decoded side of a to-be-joined pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfRecord {
    pub correlation_key: String,
    pub side: StreamSide,
    pub payload: Value,
}

/// The joined output for a correlation key, as sent to the analytics sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub id: String,
    pub customer: Value,
    pub inventory: Value,
}

impl MergedRecord {
    /// Combine a customer half and an inventory half sharing the same key.
    pub fn from_halves(customer: HalfRecord, inventory: HalfRecord) -> Self {
        debug_assert_eq!(customer.side, StreamSide::Customer);
        debug_assert_eq!(inventory.side, StreamSide::Inventory);
        debug_assert_eq!(customer.correlation_key, inventory.correlation_key);

        MergedRecord {
            id: customer.correlation_key,
            customer: customer.payload,
            inventory: inventory.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(side: StreamSide, payload: &str) -> InboundEvent {
        InboundEvent::new(side, payload.as_bytes().to_vec(), 0, 0)
    }

    #[test]
    fn test_decode_string_key() {
        let half = event(StreamSide::Customer, r#"{"id": "C1", "name": "Ada"}"#)
            .decode()
            .unwrap();

        assert_eq!(half.correlation_key, "C1");
        assert_eq!(half.side, StreamSide::Customer);
        assert_eq!(half.payload["name"], "Ada");
    }

    #[test]
    fn test_decode_integer_key() {
        let half = event(StreamSide::Inventory, r#"{"id": 42, "sku": "P1"}"#)
            .decode()
            .unwrap();

        assert_eq!(half.correlation_key, "42");
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        let cases = [
            ("", "empty"),
            (r#"{"id":"broken" "missing colon"}"#, "json"),
            (r#"["C1"]"#, "not object"),
            (r#"{"name": "no id"}"#, "missing key"),
            (r#"{"id": ""}"#, "empty key"),
            (r#"{"id": 1.5}"#, "float key"),
            (r#"{"id": null}"#, "null key"),
        ];

        for (payload, case) in cases {
            let result = event(StreamSide::Customer, payload).decode();
            assert!(result.is_err(), "expected decode failure for {case}");
        }

        assert!(matches!(
            event(StreamSide::Customer, "").decode(),
            Err(DecodeError::Empty)
        ));
        assert!(matches!(
            event(StreamSide::Customer, "nope").decode(),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            event(StreamSide::Customer, "[]").decode(),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn test_merge_keeps_both_payloads() {
        let customer = event(StreamSide::Customer, r#"{"id": "C1", "name": "Ada"}"#)
            .decode()
            .unwrap();
        let inventory = event(StreamSide::Inventory, r#"{"id": "C1", "sku": "P1"}"#)
            .decode()
            .unwrap();

        let merged = MergedRecord::from_halves(customer, inventory);

        assert_eq!(
            serde_json::to_value(&merged).unwrap(),
            json!({
                "id": "C1",
                "customer": {"id": "C1", "name": "Ada"},
                "inventory": {"id": "C1", "sku": "P1"},
            })
        );
    }

    #[test]
    fn test_topic_sides() {
        let topics = StreamTopics::new("customer_data", "inventory_data");

        assert_eq!(topics.side_for("customer_data"), Some(StreamSide::Customer));
        assert_eq!(topics.side_for("inventory_data"), Some(StreamSide::Inventory));
        assert_eq!(topics.side_for("analytics_dlq"), None);
        assert_eq!(StreamSide::Customer.other(), StreamSide::Inventory);
    }
}
