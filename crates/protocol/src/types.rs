//! Typed payloads for the `invoke` and `health` methods.
//!
//! These are the gateway-side views of the worker API. They stay loose on
//! purpose (`Value` where the manifest's schemas own the shape) so the wire
//! never rejects a payload the schema layer is responsible for judging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of an `invoke` request sent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeParams {
    pub trik_path: String,
    pub action: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, String>>,
}

/// Result of a successful `invoke` round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InvokeResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_content: Option<Value>,
    pub needs_clarification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_questions: Option<Vec<Value>>,
    pub end_session: bool,
}

/// Result of the startup `health` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub status: String,
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoke_params_wire_shape() {
        let params = InvokeParams {
            trik_path: "/triks/@demo/articles".into(),
            action: "search".into(),
            input: json!({"query": "rust"}),
            session: None,
            config: Some(BTreeMap::from([("API_KEY".to_string(), "k".to_string())])),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["trikPath"], "/triks/@demo/articles");
        assert_eq!(value["config"]["API_KEY"], "k");
        assert!(value.get("session").is_none());
    }

    #[test]
    fn test_invoke_result_defaults() {
        let result: InvokeResult = serde_json::from_value(json!({
            "agentData": {"count": 3}
        }))
        .unwrap();
        assert_eq!(result.agent_data, Some(json!({"count": 3})));
        assert!(!result.needs_clarification);
        assert!(!result.end_session);
    }

    #[test]
    fn test_health_result_parses_minimal() {
        let health: HealthResult =
            serde_json::from_value(json!({"status": "ok", "runtime": "node"})).unwrap();
        assert_eq!(health.status, "ok");
        assert!(health.version.is_none());
    }
}
