//! # Wire Protocol Messages
//!
//! Every frame on the socket is one JSON object:
//! `{ id, type, from, to, timestamp, payload }`, newline terminated.
//! `timestamp` is milliseconds since the Unix epoch. Payloads are a tagged
//! union keyed by `type`; raw JSON only becomes a [`Message`] after
//! [`crate::messaging::validation`] has checked it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ConductorError;
use crate::models::{NewTask, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ConnectionEstablished,
    AgentReady,
    AssignTask,
    TaskAccepted,
    TaskProgress,
    TaskComplete,
    TaskFailed,
    TaskCancelled,
    SystemAck,
    SystemError,
    Heartbeat,
    SubmitTask,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        Self::ConnectionEstablished,
        Self::AgentReady,
        Self::AssignTask,
        Self::TaskAccepted,
        Self::TaskProgress,
        Self::TaskComplete,
        Self::TaskFailed,
        Self::TaskCancelled,
        Self::SystemAck,
        Self::SystemError,
        Self::Heartbeat,
        Self::SubmitTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "CONNECTION_ESTABLISHED",
            Self::AgentReady => "AGENT_READY",
            Self::AssignTask => "ASSIGN_TASK",
            Self::TaskAccepted => "TASK_ACCEPTED",
            Self::TaskProgress => "TASK_PROGRESS",
            Self::TaskComplete => "TASK_COMPLETE",
            Self::TaskFailed => "TASK_FAILED",
            Self::TaskCancelled => "TASK_CANCELLED",
            Self::SystemAck => "SYSTEM_ACK",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::SubmitTask => "SUBMIT_TASK",
        }
    }

    /// Messages the orchestrator reconciles itself after a reconnect
    pub fn is_replayable(&self) -> bool {
        !matches!(
            self,
            Self::ConnectionEstablished | Self::AssignTask | Self::TaskCancelled | Self::Heartbeat
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unrecognized message type: {s}"))
    }
}

/// Role an endpoint declares when registering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Conductor,
    #[default]
    Agent,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conductor => write!(f, "conductor"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablishedPayload {
    pub connection_id: String,
    pub conductor_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentReadyPayload {
    pub role: EndpointRole,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTaskPayload {
    pub task_id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: i64,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub attempt: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRefPayload {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressPayload {
    pub task_id: TaskId,
    /// Percent complete, 0 to 100
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletePayload {
    pub task_id: TaskId,
    #[serde(default)]
    pub result: Option<Value>,
}

fn default_retryable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedPayload {
    pub task_id: TaskId,
    pub error: String,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelledPayload {
    pub task_id: TaskId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAckPayload {
    /// Id of the message being acknowledged
    pub ack_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemErrorPayload {
    pub error: String,
    pub code: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub original_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub status: Option<String>,
    pub load: Option<f64>,
}

/// Payload union; the variant always matches the message `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessagePayload {
    ConnectionEstablished(ConnectionEstablishedPayload),
    AgentReady(AgentReadyPayload),
    AssignTask(AssignTaskPayload),
    TaskAccepted(TaskRefPayload),
    TaskProgress(TaskProgressPayload),
    TaskComplete(TaskCompletePayload),
    TaskFailed(TaskFailedPayload),
    TaskCancelled(TaskCancelledPayload),
    SystemAck(SystemAckPayload),
    SystemError(SystemErrorPayload),
    Heartbeat(HeartbeatPayload),
    SubmitTask(NewTask),
}

impl MessagePayload {
    /// Decode `value` as the payload shape `kind` requires
    pub fn parse(kind: MessageType, value: Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;
        Ok(match kind {
            MessageType::ConnectionEstablished => Self::ConnectionEstablished(from_value(value)?),
            MessageType::AgentReady => Self::AgentReady(from_value(value)?),
            MessageType::AssignTask => Self::AssignTask(from_value(value)?),
            MessageType::TaskAccepted => Self::TaskAccepted(from_value(value)?),
            MessageType::TaskProgress => Self::TaskProgress(from_value(value)?),
            MessageType::TaskComplete => Self::TaskComplete(from_value(value)?),
            MessageType::TaskFailed => Self::TaskFailed(from_value(value)?),
            MessageType::TaskCancelled => Self::TaskCancelled(from_value(value)?),
            MessageType::SystemAck => Self::SystemAck(from_value(value)?),
            MessageType::SystemError => Self::SystemError(from_value(value)?),
            MessageType::Heartbeat => Self::Heartbeat(from_value(value)?),
            MessageType::SubmitTask => Self::SubmitTask(from_value(value)?),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionEstablished(_) => MessageType::ConnectionEstablished,
            Self::AgentReady(_) => MessageType::AgentReady,
            Self::AssignTask(_) => MessageType::AssignTask,
            Self::TaskAccepted(_) => MessageType::TaskAccepted,
            Self::TaskProgress(_) => MessageType::TaskProgress,
            Self::TaskComplete(_) => MessageType::TaskComplete,
            Self::TaskFailed(_) => MessageType::TaskFailed,
            Self::TaskCancelled(_) => MessageType::TaskCancelled,
            Self::SystemAck(_) => MessageType::SystemAck,
            Self::SystemError(_) => MessageType::SystemError,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::SubmitTask(_) => MessageType::SubmitTask,
        }
    }

    /// Task the payload refers to, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::AssignTask(p) => Some(&p.task_id),
            Self::TaskAccepted(p) => Some(&p.task_id),
            Self::TaskProgress(p) => Some(&p.task_id),
            Self::TaskComplete(p) => Some(&p.task_id),
            Self::TaskFailed(p) => Some(&p.task_id),
            Self::TaskCancelled(p) => Some(&p.task_id),
            Self::SystemAck(p) => p.task_id.as_deref(),
            _ => None,
        }
    }
}

/// One validated protocol message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: payload.message_type(),
            from: from.into(),
            to: to.into(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn ack(from: &str, to: &str, ack_id: &str, task_id: Option<TaskId>) -> Self {
        Self::new(
            from,
            to,
            MessagePayload::SystemAck(SystemAckPayload {
                ack_id: ack_id.to_string(),
                task_id,
            }),
        )
    }

    /// `SYSTEM_ERROR` describing `error`
    pub fn system_error(
        from: &str,
        to: &str,
        error: &ConductorError,
        original_id: Option<String>,
    ) -> Self {
        Self::new(
            from,
            to,
            MessagePayload::SystemError(SystemErrorPayload {
                error: error.to_string(),
                code: error.error_code().to_string(),
                field: error.field().map(str::to_string),
                original_id,
            }),
        )
    }

    pub fn task_id(&self) -> Option<&str> {
        self.payload.task_id()
    }

    /// Serialized frame including the trailing newline
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_names_round_trip() {
        for kind in MessageType::ALL {
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
        assert!("TASK_EXPLODED".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let message = Message::new(
            "conductor",
            "agent-7",
            MessagePayload::TaskCancelled(TaskCancelledPayload {
                task_id: "t1".into(),
                reason: None,
            }),
        );
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "TASK_CANCELLED");
        assert_eq!(value["from"], "conductor");
        assert_eq!(value["to"], "agent-7");
        assert_eq!(value["payload"]["taskId"], "t1");
        assert!(value["timestamp"].is_i64());
        assert!(message.to_json_line().unwrap().ends_with('\n'));
    }

    #[test]
    fn test_payload_parse_defaults() {
        let failed = MessagePayload::parse(
            MessageType::TaskFailed,
            json!({"taskId": "t1", "error": "disk full"}),
        )
        .unwrap();
        match failed {
            MessagePayload::TaskFailed(payload) => assert!(payload.retryable),
            other => panic!("unexpected payload {other:?}"),
        }

        let ready = MessagePayload::parse(MessageType::AgentReady, json!({})).unwrap();
        assert_eq!(ready, MessagePayload::AgentReady(AgentReadyPayload::default()));

        assert!(MessagePayload::parse(MessageType::TaskComplete, json!({})).is_err());
    }

    #[test]
    fn test_system_error_carries_code_and_field() {
        let error = ConductorError::validation_field("Missing required field", "id");
        let message = Message::system_error("conductor", "agent-1", &error, None);
        match message.payload {
            MessagePayload::SystemError(payload) => {
                assert_eq!(payload.code, "VALIDATION_ERROR");
                assert_eq!(payload.field.as_deref(), Some("id"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_replayable_types() {
        assert!(MessageType::TaskProgress.is_replayable());
        assert!(!MessageType::AssignTask.is_replayable());
        assert!(!MessageType::Heartbeat.is_replayable());
    }
}
