use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ProtocolError, Result};

pub const JSONRPC_VERSION: &str = "2.0";

/// A request, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with a fresh UUID id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A response carrying exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded wire message, discriminated by the presence of `method`.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

/// Decode one line from the wire.
///
/// Rejects anything that is not a JSON object with `jsonrpc: "2.0"`, a
/// string `id`, and either a `method` or a `result`/`error` member.
pub fn parse_message(line: &str) -> Result<JsonRpcMessage> {
    let value: Value = serde_json::from_str(line)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::InvalidMessage("message is not an object".into()))?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        _ => {
            return Err(ProtocolError::InvalidMessage(
                "missing or unsupported jsonrpc version".into(),
            ));
        }
    }

    if !obj.get("id").is_some_and(Value::is_string) {
        return Err(ProtocolError::InvalidMessage("id must be a string".into()));
    }

    if obj.contains_key("method") {
        Ok(JsonRpcMessage::Request(serde_json::from_value(value)?))
    } else if obj.contains_key("result") || obj.contains_key("error") {
        Ok(JsonRpcMessage::Response(serde_json::from_value(value)?))
    } else {
        Err(ProtocolError::InvalidMessage(
            "message has neither method nor result/error".into(),
        ))
    }
}

/// Encode a message as a single line, without the trailing newline.
pub fn serialize_message<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let line = r#"{"jsonrpc":"2.0","id":"abc","method":"invoke","params":{"action":"x"}}"#;
        match parse_message(line).unwrap() {
            JsonRpcMessage::Request(req) => {
                assert_eq!(req.id, "abc");
                assert_eq!(req.method, "invoke");
                assert_eq!(req.params, Some(json!({"action": "x"})));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_success_response() {
        let line = r#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#;
        match parse_message(line).unwrap() {
            JsonRpcMessage::Response(resp) => {
                assert_eq!(resp.result, Some(json!({"ok": true})));
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_response() {
        let line = r#"{"jsonrpc":"2.0","id":"abc","error":{"code":1003,"message":"timed out"}}"#;
        match parse_message(line).unwrap() {
            JsonRpcMessage::Response(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, crate::EXECUTION_TIMEOUT);
                assert_eq!(err.message, "timed out");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_invalid_json() {
        assert!(matches!(parse_message("{not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_reject_non_object() {
        let err = parse_message(r#"[1,2,3]"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_reject_wrong_version() {
        let err = parse_message(r#"{"jsonrpc":"1.0","id":"a","method":"m"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_reject_numeric_id() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":7,"method":"m"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_reject_missing_method_and_result() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":"a"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_serialized_message_is_single_line() {
        let req = JsonRpcRequest::new("invoke", Some(json!({"text": "line one\nline two"})));
        let line = serialize_message(&req).unwrap();
        assert!(!line.contains('\n'));
        // And it must survive the round trip.
        match parse_message(&line).unwrap() {
            JsonRpcMessage::Request(parsed) => assert_eq!(parsed, req),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = JsonRpcRequest::new("health", None);
        let b = JsonRpcRequest::new("health", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_params_omitted_when_absent() {
        let req = JsonRpcRequest::new("health", None);
        let line = serialize_message(&req).unwrap();
        assert!(!line.contains("params"));
    }
}
