//! Inbound event envelopes.
//!
//! Two wire shapes are accepted on the queue and on the ingestion endpoint:
//! a direct envelope `{"messageId": ..., "pipelineName": ..., "parameters": ...}`
//! or an Event-Grid-style array `[{"id": ..., "eventType": ..., "subject": ...,
//! "data": {...}}]`. Decoding failures are terminal for a message: malformed
//! payloads are dead-lettered, never retried.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Enumeration of reasons an inbound payload cannot be turned into events.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("envelope is neither an object nor an event array")]
    UnsupportedShape,
    #[error("message is missing a messageId")]
    MissingMessageId,
    #[error("event array holds no events")]
    EmptyBatch,
    #[error("event at index {0} is missing an id")]
    MissingEventId(usize),
    #[error("{0} must be a string")]
    NotAString(&'static str),
    #[error("stored event could not be decoded: {0}")]
    StoredEventDecode(String),
}

/// A single logical event to dispatch. The `id` doubles as the dedup key and
/// the correlation id of the downstream pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Parameters as the JSON object handed to the pipeline execution API.
    pub fn parameters_value(&self) -> Value {
        Value::Object(self.parameters.clone())
    }

    /// Rebuild an event previously serialized into the dead-letter store.
    pub fn from_stored(value: &Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::StoredEventDecode(e.to_string()))
    }
}

/// Decode a raw queue payload into the events it carries.
pub fn decode_envelope(payload: &Value) -> Result<Vec<InboundEvent>, ValidationError> {
    match payload {
        Value::Object(_) => Ok(vec![decode_direct(payload)?]),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ValidationError::EmptyBatch);
            }
            items
                .iter()
                .enumerate()
                .map(|(index, item)| decode_grid_event(item, index))
                .collect()
        }
        _ => Err(ValidationError::UnsupportedShape),
    }
}

fn required_string(
    value: &Value,
    field: &'static str,
    missing: ValidationError,
) -> Result<String, ValidationError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(missing),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(missing),
        Some(_) => Err(ValidationError::NotAString(field)),
    }
}

fn optional_string(value: &Value, field: &'static str) -> Result<Option<String>, ValidationError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::NotAString(field)),
    }
}

fn object_or_empty(value: Option<&Value>) -> serde_json::Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    }
}

fn decode_direct(payload: &Value) -> Result<InboundEvent, ValidationError> {
    let id = required_string(payload, "messageId", ValidationError::MissingMessageId)?;
    let explicit_pipeline = optional_string(payload, "pipelineName")?;

    Ok(InboundEvent {
        id,
        explicit_pipeline,
        source: optional_string(payload, "source")?,
        event_type: optional_string(payload, "eventType")?,
        parameters: object_or_empty(payload.get("parameters")),
        received_at: Utc::now(),
    })
}

fn decode_grid_event(item: &Value, index: usize) -> Result<InboundEvent, ValidationError> {
    let id = required_string(item, "id", ValidationError::MissingEventId(index))?;
    let event_type = optional_string(item, "eventType")?;

    // Prefer the payload url over the subject: blob events route on the
    // source path and the url carries the scheme the routing rules expect.
    let source = match item.get("data").and_then(|data| data.get("url")) {
        Some(Value::String(url)) => Some(url.clone()),
        _ => optional_string(item, "subject")?,
    };

    Ok(InboundEvent {
        id,
        explicit_pipeline: None,
        source,
        event_type,
        parameters: object_or_empty(item.get("data")),
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_direct_envelope() {
        let payload = json!({
            "messageId": "msg-1",
            "pipelineName": "pl_ingest",
            "parameters": {"runDate": "2024-03-01"},
        });

        let events = decode_envelope(&payload).expect("failed to decode envelope");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "msg-1");
        assert_eq!(events[0].explicit_pipeline.as_deref(), Some("pl_ingest"));
        assert_eq!(
            events[0].parameters.get("runDate"),
            Some(&json!("2024-03-01"))
        );
    }

    #[test]
    fn test_decode_direct_envelope_without_pipeline() {
        let payload = json!({"messageId": "msg-2"});

        let events = decode_envelope(&payload).expect("failed to decode envelope");

        assert_eq!(events[0].id, "msg-2");
        assert_eq!(events[0].explicit_pipeline, None);
        assert!(events[0].parameters.is_empty());
    }

    #[test]
    fn test_decode_event_grid_array() {
        let payload = json!([
            {
                "id": "evt-1",
                "eventType": "blob.created",
                "subject": "blob:raw/foo.json",
                "data": {"url": "blob:raw/foo.json", "size": 12}
            },
            {
                "id": "evt-2",
                "eventType": "emergency",
                "subject": "alerts"
            }
        ]);

        let events = decode_envelope(&payload).expect("failed to decode envelope");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "evt-1");
        assert_eq!(events[0].source.as_deref(), Some("blob:raw/foo.json"));
        assert_eq!(events[0].event_type.as_deref(), Some("blob.created"));
        assert_eq!(events[0].parameters.get("size"), Some(&json!(12)));
        assert_eq!(events[1].source.as_deref(), Some("alerts"));
    }

    #[test]
    fn test_decode_rejects_missing_message_id() {
        let payload = json!({"pipelineName": "pl_a"});

        let error = decode_envelope(&payload).unwrap_err();
        assert!(matches!(error, ValidationError::MissingMessageId));
    }

    #[test]
    fn test_decode_rejects_empty_array() {
        let error = decode_envelope(&json!([])).unwrap_err();
        assert!(matches!(error, ValidationError::EmptyBatch));
    }

    #[test]
    fn test_decode_rejects_scalars() {
        let error = decode_envelope(&json!("not an envelope")).unwrap_err();
        assert!(matches!(error, ValidationError::UnsupportedShape));
    }

    #[test]
    fn test_event_round_trips_through_storage() {
        let payload = json!({"messageId": "msg-3", "parameters": {"a": 1}});
        let event = decode_envelope(&payload).expect("failed to decode")[0].clone();

        let stored = serde_json::to_value(&event).expect("failed to serialize");
        let restored = InboundEvent::from_stored(&stored).expect("failed to restore");

        assert_eq!(restored, event);
    }
}
