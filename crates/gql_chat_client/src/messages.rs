//! `graphql-ws` frames (subscriptions-transport-ws) exchanged with the 8base
//! WebSocket endpoint, plus the GraphQL error shape shared with the HTTP client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// WebSocket subprotocol negotiated during the handshake.
pub const SUBPROTOCOL: &str = "graphql-ws";

/// Operation sent in a `start` frame (and as the HTTP request body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
}

/// Client → server frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage<'a> {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a Value>,
    },
    Start {
        id: String,
        payload: &'a OperationPayload,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
}

impl ClientMessage<'_> {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Location of a GraphQL error in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// GraphQL error as returned in `errors` arrays and `error` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphqlErrorLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
        }
    }

    /// Reads a single error object, an array of them, or a bare string.
    /// Anything unrecognised becomes one error carrying the raw payload.
    pub fn list_from_value(value: Value) -> Vec<GraphqlError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    serde_json::from_value(item.clone())
                        .unwrap_or_else(|_| GraphqlError::new(item.to_string()))
                })
                .collect(),
            Value::String(message) => vec![GraphqlError::new(message)],
            other => match serde_json::from_value(other.clone()) {
                Ok(err) => vec![err],
                Err(_) => vec![GraphqlError::new(other.to_string())],
            },
        }
    }
}

impl fmt::Display for GraphqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.path.is_empty() {
            let path: Vec<String> = self
                .path
                .iter()
                .map(|segment| match segment {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            write!(f, " (at {})", path.join("."))?;
        }
        Ok(())
    }
}

/// Messages joined with `; `, for error displays.
pub(crate) fn join_errors(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Frame that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing type")]
    MissingType,
    #[error("{0} frame without id")]
    MissingId(&'static str),
    #[error("unknown type: {0}")]
    UnknownType(String),
}

/// One server frame; discriminator is the JSON "type" field.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionAck,
    ConnectionError(Value),
    KeepAlive,
    /// Result for an operation, forwarded untouched (`{data, errors}`).
    Data { id: String, payload: Value },
    Error { id: String, errors: Vec<GraphqlError> },
    Complete { id: String },
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(value)
    }

    pub fn from_json(mut value: Value) -> Result<Self, FrameError> {
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(FrameError::MissingType)?
            .to_string();
        let id = value
            .get("id")
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let payload = value
            .as_object_mut()
            .and_then(|obj| obj.remove("payload"))
            .unwrap_or(Value::Null);

        match typ.as_str() {
            "connection_ack" => Ok(ServerMessage::ConnectionAck),
            "connection_error" => Ok(ServerMessage::ConnectionError(payload)),
            "ka" => Ok(ServerMessage::KeepAlive),
            "data" => Ok(ServerMessage::Data {
                id: id.ok_or(FrameError::MissingId("data"))?,
                payload,
            }),
            "error" => Ok(ServerMessage::Error {
                id: id.ok_or(FrameError::MissingId("error"))?,
                errors: GraphqlError::list_from_value(payload),
            }),
            "complete" => Ok(ServerMessage::Complete {
                id: id.ok_or(FrameError::MissingId("complete"))?,
            }),
            _ => Err(FrameError::UnknownType(typ)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_frame_carries_string_id_and_operation() {
        let mut variables = Map::new();
        variables.insert("id".into(), json!("42"));
        let payload = OperationPayload {
            query: "subscription { Users { node { id } } }".into(),
            variables: Some(variables),
            operation_name: None,
        };
        let text = ClientMessage::Start {
            id: "7".into(),
            payload: &payload,
        }
        .to_text()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "start",
                "id": "7",
                "payload": {
                    "query": "subscription { Users { node { id } } }",
                    "variables": {"id": "42"}
                }
            })
        );
    }

    #[test]
    fn terminate_and_init_frames() {
        let text = ClientMessage::ConnectionTerminate.to_text().unwrap();
        assert_eq!(text, r#"{"type":"connection_terminate"}"#);

        let params = json!({"workspaceId": "ws-1"});
        let text = ClientMessage::ConnectionInit {
            payload: Some(&params),
        }
        .to_text()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "connection_init", "payload": {"workspaceId": "ws-1"}})
        );
    }

    #[test]
    fn data_frame_keeps_payload_verbatim() {
        let msg = ServerMessage::from_text(
            r#"{"type":"data","id":"1","payload":{"data":{"Users":{"node":{"id":"42"}}}}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Data {
                id: "1".into(),
                payload: json!({"data": {"Users": {"node": {"id": "42"}}}}),
            }
        );
    }

    #[test]
    fn error_frame_accepts_object_or_array() {
        let single =
            ServerMessage::from_text(r#"{"type":"error","id":"2","payload":{"message":"boom"}}"#)
                .unwrap();
        let many = ServerMessage::from_json(json!({
            "type": "error",
            "id": "2",
            "payload": [{"message": "a"}, {"message": "b", "path": ["Users", 0]}]
        }))
        .unwrap();

        match single {
            ServerMessage::Error { id, errors } => {
                assert_eq!(id, "2");
                assert_eq!(errors, vec![GraphqlError::new("boom")]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match many {
            ServerMessage::Error { errors, .. } => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[1].to_string(), "b (at Users.0)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_and_incomplete_frames() {
        assert!(matches!(
            ServerMessage::from_text(r#"{"type":"next","id":"1"}"#),
            Err(FrameError::UnknownType(t)) if t == "next"
        ));
        assert!(matches!(
            ServerMessage::from_text(r#"{"type":"complete"}"#),
            Err(FrameError::MissingId("complete"))
        ));
        assert!(matches!(
            ServerMessage::from_text(r#"{"id":"1"}"#),
            Err(FrameError::MissingType)
        ));
        assert_eq!(
            ServerMessage::from_text(r#"{"type":"ka"}"#).unwrap(),
            ServerMessage::KeepAlive
        );
    }
}
