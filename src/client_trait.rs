use crate::error::IndexerResult;
use crate::models::Address;
use async_trait::async_trait;

/// Read-only view of the chain consumed by the indexing pipeline.
///
/// The production implementation speaks the access node's HTTP API; tests
/// substitute an in-memory mock.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_latest_block_header(&self) -> IndexerResult<BlockHeader>;

    /// Events of one type in an inclusive height range. The server caps the
    /// range width, so callers chunk before asking.
    async fn get_events_for_height_range(
        &self,
        event_type: &str,
        start_height: u64,
        end_height: u64,
    ) -> IndexerResult<Vec<ChainEvent>>;

    async fn get_account(&self, address: Address) -> IndexerResult<ChainAccount>;

    /// Runs a read-only script at the latest sealed block. Arguments and the
    /// result use the JSON value encoding.
    async fn execute_script_at_latest_block(
        &self,
        script: &str,
        arguments: Vec<serde_json::Value>,
    ) -> IndexerResult<serde_json::Value>;
}

#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub height: u64,
    pub id: String,
}

/// A decoded chain event; the payload is the JSON-encoded event value.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub event_type: String,
    pub transaction_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChainAccount {
    pub address: Address,
    pub keys: Vec<ChainAccountKey>,
}

#[derive(Debug, Clone)]
pub struct ChainAccountKey {
    pub index: i64,
    pub public_key: String,
    pub sig_algo: String,
    pub hash_algo: String,
    pub weight: i64,
    pub revoked: bool,
}

/// Builders and readers for the JSON value encoding used by script
/// arguments, script results and event payloads.
pub mod cadence {
    use crate::models::Address;
    use serde_json::{json, Value};

    pub fn address_value(address: &Address) -> Value {
        json!({ "type": "Address", "value": address.canonical() })
    }

    pub fn array_value(items: Vec<Value>) -> Value {
        json!({ "type": "Array", "value": items })
    }

    pub fn int_value(value: i64) -> Value {
        json!({ "type": "Int", "value": value.to_string() })
    }

    pub fn bool_value(value: bool) -> Value {
        json!({ "type": "Bool", "value": value })
    }

    pub fn string_value(value: &str) -> Value {
        json!({ "type": "String", "value": value })
    }

    pub fn uint8_value(value: i64) -> Value {
        json!({ "type": "UInt8", "value": value.to_string() })
    }

    pub fn ufix64_value(value: i64) -> Value {
        json!({ "type": "UFix64", "value": format!("{}.00000000", value) })
    }

    /// Fixed-point weights arrive as strings like `"1000.00000000"`; only
    /// the integer part is meaningful to the index.
    pub fn ufix64_to_weight(raw: &str) -> Option<i64> {
        raw.split('.').next()?.parse().ok()
    }

    /// Unwraps `{"type": ..., "value": ...}` one level.
    pub fn unwrap_value(value: &Value) -> Option<&Value> {
        value.get("value")
    }

    /// Reads the named field out of a composite (struct or event) value.
    pub fn composite_field<'a>(composite: &'a Value, name: &str) -> Option<&'a Value> {
        let fields = composite.get("value")?.get("fields")?.as_array()?;
        fields
            .iter()
            .find(|f| f.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|f| f.get("value"))
    }
}
