//! # Inbound Message Validation
//!
//! Raw frames are checked against the envelope (`id`, `type`, `from`, `to`,
//! `timestamp`) and then against the payload shape of their `type` before
//! any domain logic sees them. Failures carry the offending field so the
//! router can answer with a precise `SYSTEM_ERROR`.

use serde_json::{Map, Value};
use thiserror::Error;

use super::message::{Message, MessagePayload, MessageType};
use crate::error::ConductorError;

/// Frames larger than this are rejected before parsing
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const REQUIRED_FIELDS: [&str; 5] = ["id", "type", "from", "to", "timestamp"];

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ValidationFailure {
    pub message: String,
    pub field: Option<String>,
    /// `id` of the rejected frame, when it could be read
    pub original_id: Option<String>,
    /// `from` of the rejected frame, when it could be read
    pub sender: Option<String>,
}

impl ValidationFailure {
    fn new(message: impl Into<String>, field: Option<&str>) -> Self {
        Self {
            message: message.into(),
            field: field.map(str::to_string),
            original_id: None,
            sender: None,
        }
    }

    fn with_envelope(mut self, object: &Map<String, Value>) -> Self {
        self.original_id = non_empty_str(object, "id").map(str::to_string);
        self.sender = non_empty_str(object, "from").map(str::to_string);
        self
    }

    /// `SYSTEM_ERROR` addressed to the sender, or `unknown`
    pub fn to_error_response(&self, conductor_id: &str) -> Message {
        let recipient = self.sender.as_deref().unwrap_or("unknown");
        Message::system_error(
            conductor_id,
            recipient,
            &ConductorError::from(self.clone()),
            self.original_id.clone(),
        )
    }
}

impl From<ValidationFailure> for ConductorError {
    fn from(failure: ValidationFailure) -> Self {
        ConductorError::Validation {
            message: failure.message,
            field: failure.field,
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationFailure>;

/// Parse and validate one raw frame
pub fn parse_message(raw: &str) -> ValidationResult<Message> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(ValidationFailure::new(
            format!("Message of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit", raw.len()),
            None,
        ));
    }
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ValidationFailure::new(format!("Malformed JSON: {e}"), None))?;
    validate_value(value)
}

/// Validate an already-decoded JSON value
pub fn validate_value(value: Value) -> ValidationResult<Message> {
    let Value::Object(mut object) = value else {
        return Err(ValidationFailure::new("Message must be a JSON object", None));
    };

    validate_envelope(&object).map_err(|failure| failure.with_envelope(&object))?;

    let message_type = match object.get("type").and_then(Value::as_str) {
        Some(name) => name.parse::<MessageType>().map_err(|e| {
            ValidationFailure::new(e, Some("type")).with_envelope(&object)
        })?,
        None => {
            return Err(
                ValidationFailure::new("Field 'type' must be a string", Some("type"))
                    .with_envelope(&object),
            )
        }
    };

    let raw_payload = match object.remove("payload") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(payload @ Value::Object(_)) => payload,
        Some(_) => {
            return Err(
                ValidationFailure::new("Field 'payload' must be an object", Some("payload"))
                    .with_envelope(&object),
            )
        }
    };

    let payload = MessagePayload::parse(message_type, raw_payload).map_err(|e| {
        ValidationFailure::new(
            format!("Invalid {message_type} payload: {e}"),
            Some("payload"),
        )
        .with_envelope(&object)
    })?;
    validate_payload(&payload).map_err(|failure| failure.with_envelope(&object))?;

    Ok(Message {
        id: string_field(&object, "id"),
        message_type,
        from: string_field(&object, "from"),
        to: string_field(&object, "to"),
        timestamp: object
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        payload,
    })
}

fn validate_envelope(object: &Map<String, Value>) -> ValidationResult<()> {
    for field in REQUIRED_FIELDS {
        if !object.contains_key(field) || object[field].is_null() {
            return Err(ValidationFailure::new(
                format!("Missing required field '{field}'"),
                Some(field),
            ));
        }
    }

    for field in ["id", "from", "to"] {
        if non_empty_str(object, field).is_none() {
            return Err(ValidationFailure::new(
                format!("Field '{field}' must be a non-empty string"),
                Some(field),
            ));
        }
    }

    match object.get("timestamp").and_then(Value::as_i64) {
        Some(timestamp) if timestamp >= 0 => Ok(()),
        _ => Err(ValidationFailure::new(
            "Field 'timestamp' must be a non-negative integer of epoch milliseconds",
            Some("timestamp"),
        )),
    }
}

/// Semantic checks serde cannot express
fn validate_payload(payload: &MessagePayload) -> ValidationResult<()> {
    if let Some(task_id) = payload.task_id() {
        if task_id.trim().is_empty() {
            return Err(ValidationFailure::new(
                "Field 'taskId' must not be empty",
                Some("payload.taskId"),
            ));
        }
    }

    match payload {
        MessagePayload::TaskProgress(progress) => match progress.progress {
            Some(value) if !(0.0..=100.0).contains(&value) => Err(ValidationFailure::new(
                format!("Progress {value} is outside 0..=100"),
                Some("payload.progress"),
            )),
            _ => Ok(()),
        },
        MessagePayload::TaskFailed(failed) if failed.error.trim().is_empty() => Err(
            ValidationFailure::new("Field 'error' must not be empty", Some("payload.error")),
        ),
        MessagePayload::SystemAck(ack) if ack.ack_id.trim().is_empty() => Err(
            ValidationFailure::new("Field 'ackId' must not be empty", Some("payload.ackId")),
        ),
        MessagePayload::AgentReady(ready)
            if ready.capabilities.iter().any(|c| c.trim().is_empty()) =>
        {
            Err(ValidationFailure::new(
                "Capabilities must be non-empty strings",
                Some("payload.capabilities"),
            ))
        }
        _ => Ok(()),
    }
}

fn non_empty_str<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
}

fn string_field(object: &Map<String, Value>, field: &str) -> String {
    non_empty_str(object, field).unwrap_or_default().to_string()
}
